//! Per-user quota enforcement for new submissions.
//!
//! Counting and inserting happen in one sled transaction, and every submission
//! also holds an advisory lock for its `(user, request type)` pair while that
//! transaction runs, so two submissions can never both claim the last slot.
use std::collections::HashSet;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use sled::transaction::{ConflictableTransactionError, TransactionalTree};
use tracing::{debug, error};

use crate::error::{QuotaKind, QuotaViolation, RequestError};
use crate::ledger::{self, TerminalSet};
use crate::store::{self, ownership_key};
use crate::types::RequestType;

/// Advisory locks keyed by `(user id, request type)`.
#[derive(Debug)]
pub struct AdmissionLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
    timeout: Duration,
}

pub struct AdmissionGuard<'a> {
    locks: &'a AdmissionLocks,
    key: String,
}

/// What a successful admission check hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub request_type: RequestType,
    /// Ids of the user's existing requests of this type; the caller appends the new one.
    pub owned: Vec<String>,
}

impl AdmissionLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
            timeout,
        }
    }

    /// Waits up to the configured timeout for the pair to be free.
    pub fn acquire(
        &self,
        user_id: &str,
        request_type: &str,
    ) -> Result<AdmissionGuard<'_>, RequestError> {
        let key = ownership_key(user_id, request_type);
        let held = self.held.lock().unwrap_or_else(PoisonError::into_inner);

        if held.contains(&key) {
            debug!(user_id, request_type, "waiting for concurrent submission");
        }
        let (mut held, wait) = self
            .released
            .wait_timeout_while(held, self.timeout, |held| held.contains(&key))
            .unwrap_or_else(PoisonError::into_inner);

        if wait.timed_out() && held.contains(&key) {
            error!(
                user_id,
                request_type,
                timeout_ms = self.timeout.as_millis() as u64,
                "gave up waiting for concurrent submission"
            );
            return Err(RequestError::Conflict {
                user_id: user_id.to_string(),
                request_type: request_type.to_string(),
            });
        }

        held.insert(key.clone());
        Ok(AdmissionGuard { locks: self, key })
    }
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        self.locks
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
        self.locks.released.notify_all();
    }
}

/// Resolves the request type and checks both quotas, reading everything through
/// the transaction that will also insert the new request.
pub(crate) fn check_and_reserve(
    types: &TransactionalTree,
    ledgers: &TransactionalTree,
    ownership: &TransactionalTree,
    terminal: &TerminalSet,
    user_id: &str,
    request_type_name: &str,
) -> Result<Admission, ConflictableTransactionError<RequestError>> {
    let request_type: RequestType = match types.get(request_type_name.as_bytes())? {
        Some(bytes) => store::decode(&bytes).map_err(ConflictableTransactionError::Abort)?,
        None => {
            return Err(ConflictableTransactionError::Abort(
                RequestError::InvalidArgument(format!(
                    "request type not found: {request_type_name}"
                )),
            ));
        }
    };

    let key = ownership_key(user_id, request_type_name);
    let owned: Vec<String> = match ownership.get(key.as_bytes())? {
        Some(bytes) => store::decode(&bytes).map_err(ConflictableTransactionError::Abort)?,
        None => vec![],
    };

    if let Some(limit) = request_type.maximum_requests_per_user {
        let current = count(owned.len());
        if current >= limit {
            return Err(reject(&request_type, QuotaKind::Total, limit, current));
        }
    }

    if let Some(limit) = request_type.maximum_concurrent_requests_per_user {
        let mut active = 0;
        for request_id in &owned {
            let projection = ledger::project_in(ledgers, request_id)?;
            if terminal.is_active(&projection.status) {
                active += 1;
            }
        }
        if active >= limit {
            return Err(reject(&request_type, QuotaKind::Concurrent, limit, active));
        }
    }

    Ok(Admission {
        request_type,
        owned,
    })
}

fn count(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

fn reject(
    request_type: &RequestType,
    kind: QuotaKind,
    limit: u32,
    current: u32,
) -> ConflictableTransactionError<RequestError> {
    ConflictableTransactionError::Abort(RequestError::QuotaExceeded(QuotaViolation {
        request_type: request_type.name.clone(),
        kind,
        limit,
        current,
    }))
}
