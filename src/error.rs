use serde_json::json;
use sled::transaction::TransactionError;
use std::fmt;

use crate::config::ConfigError;
use crate::directory::DirectoryError;
use crate::notify::NotificationError;

/// Error code attached to quota rejections so clients can branch without string matching.
pub const ERR_LIMIT_REACHED: &str = "ERR_LIMIT_REACHED";

#[derive(thiserror::Error, Debug)]
pub enum RequestError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{entity} not found: {key}")]
    NotFound { entity: Entity, key: String },
    #[error("{0}")]
    QuotaExceeded(QuotaViolation),
    #[error("timed out waiting for concurrent {request_type} submissions by {user_id}")]
    Conflict {
        user_id: String,
        request_type: String,
    },
    #[error("internal error: {0}")]
    Internal(String),
    #[error("storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("failed to encode record: {0}")]
    Encode(String),
    #[error("failed to decode record: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error("malformed request details: {0}")]
    Details(#[from] serde_json::Error),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("request {request_id} was recorded but notification failed: {source}")]
    NotificationFailed {
        request_id: String,
        #[source]
        source: NotificationError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    RequestType,
    StatusCode,
    Request,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    Total,
    Concurrent,
}

/// Why an admission was refused: the limit that was hit and the count observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaViolation {
    pub request_type: String,
    pub kind: QuotaKind,
    pub limit: u32,
    pub current: u32,
}

impl RequestError {
    pub fn not_found(entity: Entity, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            key: key.into(),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidArgument(_) | Self::QuotaExceeded(_) => 400,
            // users are named in query parameters, so an unknown one is a bad request
            Self::NotFound {
                entity: Entity::User,
                ..
            } => 400,
            Self::NotFound { .. } => 404,
            Self::Conflict { .. } => 503,
            Self::Internal(_)
            | Self::Storage(_)
            | Self::Encode(_)
            | Self::Decode(_)
            | Self::Details(_)
            | Self::Directory(_)
            | Self::Config(_)
            | Self::NotificationFailed { .. } => 500,
        }
    }

    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            Self::QuotaExceeded(_) => Some(ERR_LIMIT_REACHED),
            _ => None,
        }
    }

    /// Machine readable details for errors that carry them.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::QuotaExceeded(violation) => Some(violation.details()),
            _ => None,
        }
    }

    /// Message safe to show to a caller. Server side failures never leak their cause.
    pub fn public_message(&self) -> String {
        match self {
            Self::InvalidArgument(_) | Self::NotFound { .. } | Self::QuotaExceeded(_) => {
                self.to_string()
            }
            Self::Conflict { .. } => {
                "the request conflicted with concurrent submissions; please try again".into()
            }
            Self::NotificationFailed { request_id, .. } => {
                format!("request {request_id} was recorded but notifications could not be sent")
            }
            _ => "internal server error".into(),
        }
    }
}

impl QuotaViolation {
    pub fn details(&self) -> serde_json::Value {
        match self.kind {
            QuotaKind::Total => json!({
                "requestType": self.request_type,
                "maximumRequests": self.limit,
                "submittedRequests": self.current,
            }),
            QuotaKind::Concurrent => json!({
                "requestType": self.request_type,
                "maximumActiveRequests": self.limit,
                "activeSubmittedRequests": self.current,
            }),
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RequestType => "request type",
            Self::StatusCode => "request status code",
            Self::Request => "request",
            Self::User => "user",
        };
        f.write_str(name)
    }
}

impl fmt::Display for QuotaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            QuotaKind::Total => write!(
                f,
                "the maximum number of {} requests ({}) has been reached",
                self.request_type, self.limit
            ),
            QuotaKind::Concurrent => write!(
                f,
                "the maximum number of active {} requests ({}) has been reached",
                self.request_type, self.limit
            ),
        }
    }
}

impl From<TransactionError<RequestError>> for RequestError {
    fn from(err: TransactionError<RequestError>) -> Self {
        match err {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => Self::Storage(err),
        }
    }
}
