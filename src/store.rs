//! Sled trees backing the service and the record codec
use std::sync::Arc;

use sled::{Db, Tree};

use crate::error::RequestError;

pub(crate) const REQUEST_TYPES: &str = "request_types";
pub(crate) const STATUS_CODES: &str = "request_status_codes";
pub(crate) const REQUESTS: &str = "requests";
pub(crate) const REQUEST_UPDATES: &str = "request_updates";
pub(crate) const USER_REQUESTS: &str = "user_requests";

/// Handles to every tree the service reads or writes. Cloning is cheap.
#[derive(Clone)]
pub struct Store {
    pub(crate) db: Arc<Db>,
    pub(crate) request_types: Tree,
    pub(crate) status_codes: Tree,
    pub(crate) requests: Tree,
    // request id -> ledger of status events
    pub(crate) request_updates: Tree,
    // "{user id}/{request type}" -> ids of the user's requests of that type
    pub(crate) user_requests: Tree,
}

impl Store {
    pub fn new(db: Arc<Db>) -> Result<Self, RequestError> {
        Ok(Self {
            request_types: db.open_tree(REQUEST_TYPES)?,
            status_codes: db.open_tree(STATUS_CODES)?,
            requests: db.open_tree(REQUESTS)?,
            request_updates: db.open_tree(REQUEST_UPDATES)?,
            user_requests: db.open_tree(USER_REQUESTS)?,
            db,
        })
    }

    /// Blocks until every committed write has reached disk.
    pub(crate) fn persist(&self) -> Result<(), RequestError> {
        self.db.flush()?;
        Ok(())
    }
}

// request type names never contain '/', so the key splits unambiguously from the right
pub(crate) fn ownership_key(user_id: &str, request_type: &str) -> String {
    format!("{user_id}/{request_type}")
}

pub(crate) fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, RequestError> {
    minicbor::to_vec(value).map_err(|e| RequestError::Encode(e.to_string()))
}

pub(crate) fn decode<T>(bytes: &[u8]) -> Result<T, RequestError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    Ok(minicbor::decode(bytes)?)
}
