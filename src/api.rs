//! Helpers for exposing the service over HTTP: query parameter parsing and the
//! JSON error body. Routing itself belongs to whichever server embeds the crate.
use serde::Serialize;
use serde_json::Value;

use crate::error::RequestError;
use crate::types::ListFilter;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl From<&RequestError> for ErrorResponse {
    fn from(err: &RequestError) -> Self {
        Self {
            message: err.public_message(),
            error_code: err.error_code().map(str::to_string),
            details: err.details(),
        }
    }
}

/// The `user` parameter every endpoint requires.
pub fn require_user_param(user: Option<&str>) -> Result<&str, RequestError> {
    match user {
        Some(user) if !user.is_empty() => Ok(user),
        _ => Err(RequestError::InvalidArgument(
            "missing required query parameter: user".into(),
        )),
    }
}

/// Parses a boolean the way Go's `strconv.ParseBool` does.
pub fn parse_bool_param(name: &str, value: Option<&str>, default: bool) -> Result<bool, RequestError> {
    match value {
        None | Some("") => Ok(default),
        Some("1" | "t" | "T" | "TRUE" | "true" | "True") => Ok(true),
        Some("0" | "f" | "F" | "FALSE" | "false" | "False") => Ok(false),
        Some(_) => Err(invalid_param(name)),
    }
}

/// Parses an optional request limit. Absent means unlimited; present must be a
/// positive 32-bit integer.
pub fn parse_limit_param(name: &str, value: Option<&str>) -> Result<Option<u32>, RequestError> {
    let Some(value) = value.filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    let parsed: i32 = value.parse().map_err(|_| invalid_param(name))?;
    if parsed <= 0 {
        return Err(RequestError::InvalidArgument(format!(
            "{name} must be a positive integer if specified"
        )));
    }
    Ok(Some(parsed.unsigned_abs()))
}

/// Builds a listing filter from the raw `include-completed`, `request-type`
/// and `requesting-user` parameters.
pub fn list_filter_from_query(
    include_completed: Option<&str>,
    request_type: Option<&str>,
    requesting_user: Option<&str>,
) -> Result<ListFilter, RequestError> {
    let mut filter = ListFilter::new().include_completed(parse_bool_param(
        "include-completed",
        include_completed,
        false,
    )?);
    if let Some(name) = request_type.filter(|v| !v.is_empty()) {
        filter = filter.request_type(name);
    }
    if let Some(user) = requesting_user.filter(|v| !v.is_empty()) {
        filter = filter.requesting_user(user);
    }
    Ok(filter)
}

fn invalid_param(name: &str) -> RequestError {
    RequestError::InvalidArgument(format!("invalid query parameter: {name}"))
}
