//! Core records: registries, requests and their status events
use std::cmp::Ordering;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::error::RequestError;

#[derive(Debug, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

// Written out because a derive would also demand the offset type be ordered.
impl<T: TimeZone> PartialEq for TimeStamp<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T: TimeZone> Eq for TimeStamp<T> {}

impl<T: TimeZone> PartialOrd for TimeStamp<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: TimeZone> Ord for TimeStamp<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .unwrap_or_default()
            .into()
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

/// A category of administrative request and its per-user quotas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, minicbor::Encode, minicbor::Decode)]
pub struct RequestType {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum_requests_per_user: Option<u32>,
    #[n(3)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum_concurrent_requests_per_user: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, minicbor::Encode, minicbor::Decode)]
pub struct StatusCode {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub display_name: String,
    #[n(3)]
    pub email_template: String,
}

// Requests are never rewritten once stored; status lives in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Request {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub request_type: String,
    #[n(2)]
    pub requesting_user_id: String,
    #[n(3)]
    pub requesting_user: String, // bare username, domain stripped
    #[n(4)]
    pub details: String, // JSON text, stored verbatim
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, minicbor::Encode, minicbor::Decode)]
pub struct StatusEvent {
    #[n(0)]
    pub id: u64, // monotonic, breaks timestamp ties
    #[n(1)]
    #[serde(skip)]
    pub request_id: String,
    #[n(2)]
    pub status: String,
    #[n(3)]
    #[serde(skip)]
    pub updating_user_id: String,
    #[n(4)]
    pub updating_user: String,
    #[n(5)]
    pub created_date: TimeStamp<Utc>,
    #[n(6)]
    pub message: String,
}

/// The current status of a request, derived from its last ledger event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Projection {
    pub status: String,
    pub timestamp: TimeStamp<Utc>,
    #[serde(skip)]
    pub event_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestSummary {
    pub id: String,
    pub requesting_user: String,
    pub request_type: String,
    pub details: Value,
    pub status: String,
    pub updated_date: TimeStamp<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestDetails {
    pub id: String,
    pub requesting_user: String,
    pub request_type: String,
    pub details: Value,
    pub status: String,
    pub updated_date: TimeStamp<Utc>,
    pub updates: Vec<StatusEvent>,
}

/// Body of a new submission.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RequestSubmission {
    pub request_type: String,
    #[serde(default)]
    pub details: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub include_completed: bool,
    pub request_type: Option<String>,
    pub requesting_user: Option<String>,
}

impl Request {
    pub fn parsed_details(&self) -> Result<Value, RequestError> {
        Ok(serde_json::from_str(&self.details)?)
    }

    pub(crate) fn summarize(&self, current: &Projection) -> Result<RequestSummary, RequestError> {
        Ok(RequestSummary {
            id: self.id.clone(),
            requesting_user: self.requesting_user.clone(),
            request_type: self.request_type.clone(),
            details: self.parsed_details()?,
            status: current.status.clone(),
            updated_date: current.timestamp.clone(),
        })
    }
}

impl StatusEvent {
    pub fn projection(&self) -> Projection {
        Projection {
            status: self.status.clone(),
            timestamp: self.created_date.clone(),
            event_id: self.id,
        }
    }
}

impl RequestSubmission {
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.request_type.is_empty() {
            return Err(RequestError::InvalidArgument(
                "invalid request body: request_type is required".into(),
            ));
        }
        if self.details.is_null() {
            return Err(RequestError::InvalidArgument(
                "invalid request body: details are required".into(),
            ));
        }
        Ok(())
    }
}

impl ListFilter {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn include_completed(mut self, include: bool) -> Self {
        self.include_completed = include;
        self
    }
    pub fn request_type(mut self, name: &str) -> Self {
        self.request_type = Some(name.to_string());
        self
    }
    pub fn requesting_user(mut self, username: &str) -> Self {
        self.requesting_user = Some(username.to_string());
        self
    }

    pub(crate) fn matches(&self, request: &Request) -> bool {
        let type_matches = self
            .request_type
            .as_deref()
            .is_none_or(|name| name == request.request_type);
        let user_matches = self
            .requesting_user
            .as_deref()
            .is_none_or(|user| user == request.requesting_user);

        type_matches && user_matches
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl Serialize for TimeStamp<Utc> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_rfc3339())
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}
