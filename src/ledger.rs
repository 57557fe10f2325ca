//! The append-only status ledger and the projection of a request's current status.
//!
//! Each request owns one [`Ledger`] holding every [`StatusEvent`] ever recorded
//! against it. Nothing stores a request's status directly: the current status is
//! always [`Ledger::current`], the event with the greatest `(created_date, id)`.
//! Single lookups and bulk listings both go through that function so they can
//! never disagree.
use std::collections::{BTreeMap, BTreeSet};

use sled::transaction::{ConflictableTransactionError, TransactionalTree};
use sled::Transactional;

use crate::directory::User;
use crate::error::{Entity, RequestError};
use crate::store::{self, Store};
use crate::types::{Projection, Request, StatusCode, StatusEvent, TimeStamp};

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Ledger {
    #[n(0)]
    pub request_id: String,
    #[n(1)]
    events: Vec<StatusEvent>,
}

/// Status code names after which a request no longer counts as active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalSet(BTreeSet<String>);

/// Storage operations over the ledger tree.
#[derive(Clone)]
pub struct StatusLedger {
    store: Store,
}

impl Ledger {
    pub fn new(request_id: String) -> Self {
        Self {
            request_id,
            events: vec![],
        }
    }

    /// Records a new event. The timestamp is clamped so it never precedes the
    /// current event, which keeps append order and chronological order equal.
    pub fn append(
        &mut self,
        id: u64,
        status: &str,
        actor: &User,
        message: &str,
    ) -> &StatusEvent {
        let mut created_date = TimeStamp::new();
        if let Some(current) = self.current() {
            if current.created_date > created_date {
                created_date = current.created_date.clone();
            }
        }

        self.events.push(StatusEvent {
            id,
            request_id: self.request_id.clone(),
            status: status.to_string(),
            updating_user_id: actor.id.clone(),
            updating_user: actor.bare_username().to_string(),
            created_date,
            message: message.to_string(),
        });
        &self.events[self.events.len() - 1]
    }

    /// Inserts an already built event, used when replaying or testing.
    pub fn insert_event(&mut self, event: StatusEvent) {
        self.events.push(event);
    }

    pub fn current(&self) -> Option<&StatusEvent> {
        self.events
            .iter()
            .max_by(|a, b| (&a.created_date, a.id).cmp(&(&b.created_date, b.id)))
    }

    pub fn projection(&self) -> Option<Projection> {
        self.current().map(StatusEvent::projection)
    }

    /// Events in chronological order.
    pub fn history(&self) -> Vec<StatusEvent> {
        let mut events = self.events.clone();
        events.sort_by(|a, b| (&a.created_date, a.id).cmp(&(&b.created_date, b.id)));
        events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl TerminalSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    pub fn is_terminal(&self, status: &str) -> bool {
        self.0.contains(status)
    }

    pub fn is_active(&self, status: &str) -> bool {
        !self.is_terminal(status)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl Default for TerminalSet {
    fn default() -> Self {
        Self::new(["approved", "rejected"])
    }
}

impl StatusLedger {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Appends a status event to an existing request in its own transaction.
    pub fn append_event(
        &self,
        request_id: &str,
        status: &str,
        actor: &User,
        message: &str,
    ) -> Result<(Request, StatusCode, StatusEvent), RequestError> {
        let store = &self.store;
        let appended = (&store.status_codes, &store.requests, &store.request_updates)
            .transaction(|(codes, requests, ledgers)| {
                append_in(codes, requests, ledgers, request_id, status, actor, message)
            })?;

        store.persist()?;
        Ok(appended)
    }

    pub fn load(&self, request_id: &str) -> Result<Option<Ledger>, RequestError> {
        self.store
            .request_updates
            .get(request_id.as_bytes())?
            .map(|bytes| store::decode(&bytes))
            .transpose()
    }

    pub fn project_current(&self, request_id: &str) -> Result<Option<Projection>, RequestError> {
        Ok(self.load(request_id)?.and_then(|ledger| ledger.projection()))
    }

    /// Projects many requests in one ordered pass over the ledger tree.
    /// Identifiers without a ledger are left out.
    pub fn project_current_batch<'a, I>(
        &self,
        request_ids: I,
    ) -> Result<BTreeMap<String, Projection>, RequestError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let wanted: BTreeSet<&str> = request_ids.into_iter().collect();
        let (Some(first), Some(last)) = (wanted.first(), wanted.last()) else {
            return Ok(BTreeMap::new());
        };

        let mut projections = BTreeMap::new();
        let span = first.as_bytes()..=last.as_bytes();
        for entry in self.store.request_updates.range(span) {
            let (key, bytes) = entry?;
            let Ok(request_id) = std::str::from_utf8(&key) else {
                continue;
            };
            if !wanted.contains(request_id) {
                continue;
            }
            let ledger: Ledger = store::decode(&bytes)?;
            if let Some(projection) = ledger.projection() {
                projections.insert(request_id.to_string(), projection);
            }
        }
        Ok(projections)
    }

    pub fn list_events(&self, request_id: &str) -> Result<Vec<StatusEvent>, RequestError> {
        Ok(self
            .load(request_id)?
            .map(|ledger| ledger.history())
            .unwrap_or_default())
    }
}

/// Appends an event inside a caller supplied transaction.
pub(crate) fn append_in(
    codes: &TransactionalTree,
    requests: &TransactionalTree,
    ledgers: &TransactionalTree,
    request_id: &str,
    status: &str,
    actor: &User,
    message: &str,
) -> Result<(Request, StatusCode, StatusEvent), ConflictableTransactionError<RequestError>> {
    let request: Request = match requests.get(request_id.as_bytes())? {
        Some(bytes) => store::decode(&bytes).map_err(ConflictableTransactionError::Abort)?,
        None => {
            return Err(ConflictableTransactionError::Abort(RequestError::not_found(
                Entity::Request,
                request_id,
            )));
        }
    };
    let code: StatusCode = match codes.get(status.as_bytes())? {
        Some(bytes) => store::decode(&bytes).map_err(ConflictableTransactionError::Abort)?,
        None => {
            return Err(ConflictableTransactionError::Abort(RequestError::not_found(
                Entity::StatusCode,
                status,
            )));
        }
    };
    let mut ledger: Ledger = match ledgers.get(request_id.as_bytes())? {
        Some(bytes) => store::decode(&bytes).map_err(ConflictableTransactionError::Abort)?,
        None => {
            return Err(ConflictableTransactionError::Abort(RequestError::Internal(
                format!("request {request_id} has no status ledger"),
            )));
        }
    };

    // Db::generate_id would wait on the lock this transaction already holds
    let id = ledgers
        .generate_id()
        .map_err(ConflictableTransactionError::Storage)?;
    let event = ledger.append(id, &code.name, actor, message).clone();
    let encoded = store::encode(&ledger).map_err(ConflictableTransactionError::Abort)?;
    ledgers.insert(request_id.as_bytes(), encoded)?;

    Ok((request, code, event))
}

/// Current status of one request, read inside a transaction.
pub(crate) fn project_in(
    ledgers: &TransactionalTree,
    request_id: &str,
) -> Result<Projection, ConflictableTransactionError<RequestError>> {
    let ledger: Ledger = match ledgers.get(request_id.as_bytes())? {
        Some(bytes) => store::decode(&bytes).map_err(ConflictableTransactionError::Abort)?,
        None => {
            return Err(ConflictableTransactionError::Abort(RequestError::Internal(
                format!("request {request_id} has no status ledger"),
            )));
        }
    };
    ledger.projection().ok_or_else(|| {
        ConflictableTransactionError::Abort(RequestError::Internal(format!(
            "request {request_id} has an empty status ledger"
        )))
    })
}
