//! Post-commit notifications. Delivery happens outside this crate; the service
//! only builds the messages and hands them to the injected clients.
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::directory::User;
use crate::types::{Request, RequestType, StatusCode, StatusEvent};

pub const NOTIFICATION_TYPE: &str = "requests";
pub const SUBMITTED_EMAIL_SUBJECT: &str = "New Administrative Request";

#[derive(thiserror::Error, Debug)]
pub enum NotificationError {
    #[error("unable to send email to {to}: {reason}")]
    Email { to: String, reason: String },
    #[error("unable to send notification to {user}: {reason}")]
    Notification { user: String, reason: String },
}

/// A message for the notification agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: String,
    pub user: String,
    pub subject: String,
    pub message: String,
    pub email: bool,
    pub email_template: String,
    pub payload: Value,
}

pub trait EmailClient: Send + Sync {
    fn send(
        &self,
        to: &str,
        template: &str,
        subject: &str,
        payload: &Value,
    ) -> Result<(), NotificationError>;
}

pub trait NotificationClient: Send + Sync {
    fn send(&self, notification: &Notification) -> Result<(), NotificationError>;
}

#[derive(Clone)]
pub struct Dispatcher {
    email: Arc<dyn EmailClient>,
    notifications: Arc<dyn NotificationClient>,
    admin_email: Option<String>,
}

impl Dispatcher {
    pub fn new(email: Arc<dyn EmailClient>, notifications: Arc<dyn NotificationClient>) -> Self {
        Self {
            email,
            notifications,
            admin_email: None,
        }
    }

    pub fn with_admin_email(mut self, admin_email: Option<String>) -> Self {
        self.admin_email = admin_email;
        self
    }

    /// Tells the requester their request arrived and emails the administrators.
    /// Both are attempted; the first failure is returned.
    pub fn request_submitted(
        &self,
        request: &Request,
        request_type: &RequestType,
        status: &StatusCode,
        requester: &User,
    ) -> Result<(), NotificationError> {
        let payload = request_payload(request, requester);

        let notified = self.notifications.send(&Notification {
            kind: NOTIFICATION_TYPE.into(),
            user: request.requesting_user.clone(),
            subject: format!("{} request submitted", request_type.name),
            message: format!("Your {} request has been submitted.", request_type.name),
            email: true,
            email_template: status.email_template.clone(),
            payload: payload.clone(),
        });

        let emailed = match &self.admin_email {
            Some(admin_email) => self.email.send(
                admin_email,
                &status.email_template,
                SUBMITTED_EMAIL_SUBJECT,
                &payload,
            ),
            None => Ok(()),
        };
        notified.and(emailed)
    }

    pub fn status_updated(
        &self,
        request: &Request,
        status: &StatusCode,
        event: &StatusEvent,
        requester: Option<&User>,
    ) -> Result<(), NotificationError> {
        let fallback = User::new(
            request.requesting_user_id.clone(),
            request.requesting_user.clone(),
        );
        let mut payload = request_payload(request, requester.unwrap_or(&fallback));
        if let Value::Object(fields) = &mut payload {
            fields.insert("status".into(), Value::from(status.name.clone()));
            fields.insert(
                "status_display_name".into(),
                Value::from(status.display_name.clone()),
            );
            fields.insert("message".into(), Value::from(event.message.clone()));
        }

        self.notifications.send(&Notification {
            kind: NOTIFICATION_TYPE.into(),
            user: request.requesting_user.clone(),
            subject: format!("{} request {}", request.request_type, status.display_name),
            message: event.message.clone(),
            email: true,
            email_template: status.email_template.clone(),
            payload,
        })
    }
}

// Top level fields of object details are copied; anything else is nested under "details".
fn request_payload(request: &Request, requester: &User) -> Value {
    let mut fields = match request.parsed_details() {
        Ok(Value::Object(fields)) => fields,
        Ok(other) => Map::from_iter([("details".to_string(), other)]),
        Err(_) => Map::new(),
    };

    fields.insert("request_id".into(), Value::from(request.id.clone()));
    fields.insert(
        "request_type".into(),
        Value::from(request.request_type.clone()),
    );
    fields.insert(
        "username".into(),
        Value::from(requester.bare_username().to_string()),
    );
    if let Some(email) = &requester.email {
        fields.insert("email_address".into(), Value::from(email.clone()));
    }
    Value::Object(fields)
}
