//! Request types and status codes: the reference data the lifecycle consults.
use sled::transaction::ConflictableTransactionError;
use tracing::info;

use crate::config::StatusCodeSeed;
use crate::error::{Entity, RequestError};
use crate::store::{self, Store};
use crate::types::{RequestType, StatusCode};
use crate::utils::{new_uuid_to_bech32, validate_request_type_name};

#[derive(Clone)]
pub struct Registry {
    store: Store,
}

impl Registry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Creates the request type, or returns the existing one untouched if the
    /// name is already registered, whatever limits were supplied.
    pub fn register_type(
        &self,
        name: &str,
        maximum_requests_per_user: Option<u32>,
        maximum_concurrent_requests_per_user: Option<u32>,
    ) -> Result<RequestType, RequestError> {
        validate_request_type_name(name)?;
        validate_limit("maximum-requests-per-user", maximum_requests_per_user)?;
        validate_limit(
            "maximum-concurrent-requests-per-user",
            maximum_concurrent_requests_per_user,
        )?;

        let request_type = RequestType {
            id: new_uuid_to_bech32("rtype_")?,
            name: name.to_string(),
            maximum_requests_per_user,
            maximum_concurrent_requests_per_user,
        };

        let swapped = self.store.request_types.compare_and_swap(
            name.as_bytes(),
            None as Option<&[u8]>,
            Some(store::encode(&request_type)?),
        )?;

        match swapped {
            Ok(()) => {
                self.store.persist()?;
                info!(request_type = name, "registered request type");
                Ok(request_type)
            }
            Err(existing) => match existing.current {
                Some(bytes) => store::decode(&bytes),
                None => Err(RequestError::Internal(format!(
                    "request type {name} vanished during registration"
                ))),
            },
        }
    }

    /// Changes only the limits that are supplied.
    pub fn update_type(
        &self,
        name: &str,
        maximum_requests_per_user: Option<u32>,
        maximum_concurrent_requests_per_user: Option<u32>,
    ) -> Result<RequestType, RequestError> {
        validate_limit("maximum-requests-per-user", maximum_requests_per_user)?;
        validate_limit(
            "maximum-concurrent-requests-per-user",
            maximum_concurrent_requests_per_user,
        )?;

        let updated = self.store.request_types.transaction(|types| {
            let mut request_type: RequestType = match types.get(name.as_bytes())? {
                Some(bytes) => store::decode(&bytes).map_err(ConflictableTransactionError::Abort)?,
                None => {
                    return Err(ConflictableTransactionError::Abort(RequestError::not_found(
                        Entity::RequestType,
                        name,
                    )));
                }
            };

            if maximum_requests_per_user.is_none() && maximum_concurrent_requests_per_user.is_none()
            {
                return Ok(request_type);
            }
            if maximum_requests_per_user.is_some() {
                request_type.maximum_requests_per_user = maximum_requests_per_user;
            }
            if maximum_concurrent_requests_per_user.is_some() {
                request_type.maximum_concurrent_requests_per_user =
                    maximum_concurrent_requests_per_user;
            }

            let encoded = store::encode(&request_type).map_err(ConflictableTransactionError::Abort)?;
            types.insert(name.as_bytes(), encoded)?;
            Ok(request_type)
        })?;

        self.store.persist()?;
        info!(
            request_type = name,
            maximum_requests_per_user = ?updated.maximum_requests_per_user,
            maximum_concurrent_requests_per_user = ?updated.maximum_concurrent_requests_per_user,
            "updated request type"
        );
        Ok(updated)
    }

    pub fn get_type(&self, name: &str) -> Result<Option<RequestType>, RequestError> {
        self.store
            .request_types
            .get(name.as_bytes())?
            .map(|bytes| store::decode(&bytes))
            .transpose()
    }

    /// All request types, sorted by name.
    pub fn list_types(&self) -> Result<Vec<RequestType>, RequestError> {
        self.store
            .request_types
            .iter()
            .values()
            .map(|bytes| store::decode(&bytes?))
            .collect()
    }

    pub fn get_status_code(&self, name: &str) -> Result<Option<StatusCode>, RequestError> {
        self.store
            .status_codes
            .get(name.as_bytes())?
            .map(|bytes| store::decode(&bytes))
            .transpose()
    }

    /// All status codes, sorted by name.
    pub fn list_status_codes(&self) -> Result<Vec<StatusCode>, RequestError> {
        self.store
            .status_codes
            .iter()
            .values()
            .map(|bytes| store::decode(&bytes?))
            .collect()
    }

    /// Inserts the seeds that are missing. Existing status codes are left as they are.
    pub fn seed_status_codes(&self, seeds: &[StatusCodeSeed]) -> Result<usize, RequestError> {
        let mut inserted = 0;
        for seed in seeds {
            let code = StatusCode {
                id: new_uuid_to_bech32("rsc_")?,
                name: seed.name.clone(),
                display_name: seed.display_name.clone(),
                email_template: seed.email_template.clone(),
            };
            let swapped = self.store.status_codes.compare_and_swap(
                seed.name.as_bytes(),
                None as Option<&[u8]>,
                Some(store::encode(&code)?),
            )?;
            if swapped.is_ok() {
                inserted += 1;
            }
        }

        if inserted > 0 {
            self.store.persist()?;
            info!(inserted, "seeded request status codes");
        }
        Ok(inserted)
    }
}

fn validate_limit(param: &str, limit: Option<u32>) -> Result<(), RequestError> {
    if limit == Some(0) {
        return Err(RequestError::InvalidArgument(format!(
            "{param} must be a positive integer if specified"
        )));
    }
    Ok(())
}
