//! Service layer API for the request lifecycle
use std::sync::Arc;

use serde_json::Value;
use sled::Transactional;
use sled::transaction::ConflictableTransactionError;
use tracing::{debug, info, warn};

use crate::admission::{self, AdmissionLocks};
use crate::config::{LifecycleConfig, ServiceConfig};
use crate::directory::{User, UserDirectory};
use crate::error::{Entity, RequestError};
use crate::ledger::{Ledger, StatusLedger, TerminalSet};
use crate::notify::{Dispatcher, NotificationError};
use crate::registry::Registry;
use crate::store::{self, Store, ownership_key};
use crate::types::{
    ListFilter, Request, RequestDetails, RequestSummary, StatusCode, StatusEvent,
};
use crate::utils::{new_uuid_to_bech32, qualify_username};

pub struct RequestService {
    store: Store,
    registry: Registry,
    ledger: StatusLedger,
    terminal: TerminalSet,
    lifecycle: LifecycleConfig,
    locks: AdmissionLocks,
    directory: Arc<dyn UserDirectory>,
    dispatcher: Option<Dispatcher>,
    user_domain: Option<String>,
    admin_email: Option<String>,
}

impl RequestService {
    /// Builds the service over an open database, seeding the configured status codes.
    pub fn new(
        instance: Arc<sled::Db>,
        config: ServiceConfig,
        directory: Arc<dyn UserDirectory>,
    ) -> Result<Self, RequestError> {
        config.validate()?;

        let store = Store::new(instance)?;
        let registry = Registry::new(store.clone());
        registry.seed_status_codes(&config.status_codes)?;

        let initial = &config.lifecycle.initial_status;
        if registry.get_status_code(initial)?.is_none() {
            return Err(RequestError::InvalidArgument(format!(
                "initial status code {initial} is not registered"
            )));
        }

        Ok(Self {
            ledger: StatusLedger::new(store.clone()),
            terminal: TerminalSet::new(config.lifecycle.terminal_statuses.iter().cloned()),
            locks: AdmissionLocks::new(config.admission.lock_timeout()),
            lifecycle: config.lifecycle,
            user_domain: config.user_domain,
            admin_email: config.admin_email,
            dispatcher: None,
            directory,
            registry,
            store,
        })
    }

    /// Opens the database at the configured path.
    pub fn open(
        config: ServiceConfig,
        directory: Arc<dyn UserDirectory>,
    ) -> Result<Self, RequestError> {
        let db = sled::open(&config.db_path)?;
        Self::new(Arc::new(db), config, directory)
    }

    /// Installs the notification dispatcher. A configured `admin_email` takes
    /// precedence over the dispatcher's own.
    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        let dispatcher = match &self.admin_email {
            Some(admin_email) => dispatcher.with_admin_email(Some(admin_email.clone())),
            None => dispatcher,
        };
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn ledger(&self) -> &StatusLedger {
        &self.ledger
    }

    pub fn terminal_statuses(&self) -> &TerminalSet {
        &self.terminal
    }

    pub fn admission_locks(&self) -> &AdmissionLocks {
        &self.locks
    }

    /// Submits a new request, subject to the request type's quotas.
    pub fn submit(
        &self,
        username: &str,
        request_type: &str,
        details: Value,
    ) -> Result<RequestSummary, RequestError> {
        if details.is_null() {
            return Err(RequestError::InvalidArgument(
                "request details are required".into(),
            ));
        }
        let requester = self.resolve_user(username)?;
        let details_json = serde_json::to_string(&details)?;

        let guard = self.locks.acquire(&requester.id, request_type)?;

        let store = &self.store;
        let initial = self.lifecycle.initial_status.as_str();
        let committed = (
            &store.request_types,
            &store.status_codes,
            &store.requests,
            &store.request_updates,
            &store.user_requests,
        )
            .transaction(|(types, codes, requests, ledgers, ownership)| {
                let mut admission = admission::check_and_reserve(
                    types,
                    ledgers,
                    ownership,
                    &self.terminal,
                    &requester.id,
                    request_type,
                )?;

                let status: StatusCode = match codes.get(initial.as_bytes())? {
                    Some(bytes) => {
                        store::decode(&bytes).map_err(ConflictableTransactionError::Abort)?
                    }
                    None => {
                        return Err(ConflictableTransactionError::Abort(RequestError::Internal(
                            format!("initial status code {initial} is missing"),
                        )));
                    }
                };

                let request = Request {
                    id: new_uuid_to_bech32("req_").map_err(ConflictableTransactionError::Abort)?,
                    request_type: admission.request_type.name.clone(),
                    requesting_user_id: requester.id.clone(),
                    requesting_user: requester.bare_username().to_string(),
                    details: details_json.clone(),
                };

                let mut ledger = Ledger::new(request.id.clone());
                let event_id = ledgers
                    .generate_id()
                    .map_err(ConflictableTransactionError::Storage)?;
                let event = ledger
                    .append(
                        event_id,
                        &status.name,
                        &requester,
                        &self.lifecycle.submitted_message,
                    )
                    .clone();

                admission.owned.push(request.id.clone());

                requests.insert(
                    request.id.as_bytes(),
                    store::encode(&request).map_err(ConflictableTransactionError::Abort)?,
                )?;
                ledgers.insert(
                    request.id.as_bytes(),
                    store::encode(&ledger).map_err(ConflictableTransactionError::Abort)?,
                )?;
                ownership.insert(
                    ownership_key(&requester.id, request_type).as_bytes(),
                    store::encode(&admission.owned).map_err(ConflictableTransactionError::Abort)?,
                )?;

                Ok((request, admission.request_type, status, event))
            });

        let (request, rtype, status, event) = match committed {
            Ok(committed) => committed,
            Err(err) => {
                let err = RequestError::from(err);
                if let RequestError::QuotaExceeded(violation) = &err {
                    warn!(
                        user = requester.bare_username(),
                        request_type,
                        limit = violation.limit,
                        current = violation.current,
                        "submission rejected by quota"
                    );
                }
                return Err(err);
            }
        };

        store.persist()?;
        drop(guard);
        info!(
            request_id = %request.id,
            request_type = %request.request_type,
            user = %request.requesting_user,
            "request submitted"
        );

        let summary = request.summarize(&event.projection())?;

        if let Some(dispatcher) = &self.dispatcher {
            dispatcher
                .request_submitted(&request, &rtype, &status, &requester)
                .map_err(|source| self.notification_failed(&request.id, source))?;
        }
        Ok(summary)
    }

    /// Appends a status event to the request and notifies the requester.
    pub fn update_status(
        &self,
        request_id: &str,
        status: &str,
        username: &str,
        message: &str,
    ) -> Result<StatusEvent, RequestError> {
        let actor = self.resolve_user(username)?;
        let (request, code, event) = self
            .ledger
            .append_event(request_id, status, &actor, message)?;

        info!(
            request_id,
            status = %code.name,
            user = %event.updating_user,
            terminal = self.terminal.is_terminal(&code.name),
            "request status updated"
        );

        if let Some(dispatcher) = &self.dispatcher {
            let requester = match self.find_user(&request.requesting_user) {
                Ok(requester) => requester,
                Err(err) => {
                    warn!(
                        request_id,
                        error = %err,
                        "requester lookup failed, notifying without email"
                    );
                    None
                }
            };
            dispatcher
                .status_updated(&request, &code, &event, requester.as_ref())
                .map_err(|source| self.notification_failed(request_id, source))?;
        }
        Ok(event)
    }

    pub fn get_details(&self, request_id: &str) -> Result<Option<RequestDetails>, RequestError> {
        let Some(request) = self.load_request(request_id)? else {
            return Ok(None);
        };
        let ledger = self
            .ledger
            .load(request_id)?
            .unwrap_or_else(|| Ledger::new(request_id.into()));
        let Some(current) = ledger.projection() else {
            return Err(RequestError::Internal(format!(
                "request {request_id} has no status events"
            )));
        };

        Ok(Some(RequestDetails {
            details: request.parsed_details()?,
            id: request.id,
            requesting_user: request.requesting_user,
            request_type: request.request_type,
            status: current.status,
            updated_date: current.timestamp,
            updates: ledger.history(),
        }))
    }

    /// Lists requests matching the filter, oldest current status first.
    pub fn list(&self, filter: &ListFilter) -> Result<Vec<RequestSummary>, RequestError> {
        let mut candidates = vec![];
        for bytes in self.store.requests.iter().values() {
            let request: Request = store::decode(&bytes?)?;
            if filter.matches(&request) {
                candidates.push(request);
            }
        }

        let projections = self
            .ledger
            .project_current_batch(candidates.iter().map(|request| request.id.as_str()))?;

        let mut listing = vec![];
        for request in &candidates {
            let Some(current) = projections.get(&request.id) else {
                debug!(request_id = %request.id, "skipping request without visible ledger");
                continue;
            };
            if !filter.include_completed && self.terminal.is_terminal(&current.status) {
                continue;
            }
            listing.push((current, request.summarize(current)?));
        }

        listing.sort_by(|(a, _), (b, _)| {
            (&a.timestamp, a.event_id).cmp(&(&b.timestamp, b.event_id))
        });
        Ok(listing.into_iter().map(|(_, summary)| summary).collect())
    }

    fn load_request(&self, request_id: &str) -> Result<Option<Request>, RequestError> {
        self.store
            .requests
            .get(request_id.as_bytes())?
            .map(|bytes| store::decode(&bytes))
            .transpose()
    }

    fn find_user(&self, username: &str) -> Result<Option<User>, RequestError> {
        let qualified = qualify_username(username, self.user_domain.as_deref());
        Ok(self.directory.find_user(&qualified)?)
    }

    /// Fails closed: an empty or unknown username is an error.
    fn resolve_user(&self, username: &str) -> Result<User, RequestError> {
        if username.is_empty() {
            return Err(RequestError::InvalidArgument(
                "missing required query parameter: user".into(),
            ));
        }
        self.find_user(username)?
            .ok_or_else(|| RequestError::not_found(Entity::User, username))
    }

    fn notification_failed(
        &self,
        request_id: &str,
        source: NotificationError,
    ) -> RequestError {
        warn!(request_id, error = %source, "notification failed after commit");
        RequestError::NotificationFailed {
            request_id: request_id.to_string(),
            source,
        }
    }
}
