//! Service configuration, read from TOML.
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::Level;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Appended as `@domain` to usernames before directory lookups.
    #[serde(default)]
    pub user_domain: Option<String>,

    /// Recipient of new submission emails. No email is sent when unset.
    #[serde(default)]
    pub admin_email: Option<String>,

    #[serde(default)]
    pub log_level: LogLevel,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Status codes inserted at startup when missing.
    #[serde(default = "default_status_codes")]
    pub status_codes: Vec<StatusCodeSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_initial_status")]
    pub initial_status: String,

    #[serde(default = "default_submitted_message")]
    pub submitted_message: String,

    #[serde(default = "default_terminal_statuses")]
    pub terminal_statuses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// How long a submission waits for another submission by the same user
    /// for the same request type before giving up.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCodeSeed {
    pub name: String,
    pub display_name: String,
    pub email_template: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl ServiceConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let lifecycle = &self.lifecycle;

        if lifecycle.initial_status.is_empty() {
            return Err(ConfigError::Validation(
                "lifecycle.initial_status must not be empty".into(),
            ));
        }
        if lifecycle.terminal_statuses.is_empty() {
            return Err(ConfigError::Validation(
                "lifecycle.terminal_statuses must name at least one status".into(),
            ));
        }
        if lifecycle.terminal_statuses.contains(&lifecycle.initial_status) {
            return Err(ConfigError::Validation(format!(
                "initial status {} cannot also be terminal",
                lifecycle.initial_status
            )));
        }
        if self.admission.lock_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "admission.lock_timeout_ms must be at least 1".into(),
            ));
        }

        let mut seen = HashSet::new();
        for seed in &self.status_codes {
            if seed.name.is_empty() {
                return Err(ConfigError::Validation(
                    "status code names must not be empty".into(),
                ));
            }
            if !seen.insert(seed.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "status code {} is seeded more than once",
                    seed.name
                )));
            }
        }
        Ok(())
    }
}

impl AdmissionConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            user_domain: None,
            admin_email: None,
            log_level: LogLevel::default(),
            lifecycle: LifecycleConfig::default(),
            admission: AdmissionConfig::default(),
            status_codes: default_status_codes(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            initial_status: default_initial_status(),
            submitted_message: default_submitted_message(),
            terminal_statuses: default_terminal_statuses(),
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl StatusCodeSeed {
    pub fn new(name: &str, display_name: &str, email_template: &str) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            email_template: email_template.into(),
        }
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

pub fn setup_tracing(log_level: LogLevel) {
    let level: Level = log_level.into();
    let default_filter = format!("admin_requests={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

fn default_db_path() -> PathBuf {
    PathBuf::from("requests.db")
}

fn default_initial_status() -> String {
    "submitted".into()
}

fn default_submitted_message() -> String {
    "Request submitted.".into()
}

fn default_terminal_statuses() -> Vec<String> {
    vec!["approved".into(), "rejected".into()]
}

const fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_status_codes() -> Vec<StatusCodeSeed> {
    vec![
        StatusCodeSeed::new("submitted", "Submitted", "request_submitted"),
        StatusCodeSeed::new("in-progress", "In Progress", "request_in_progress"),
        StatusCodeSeed::new("approved", "Approved", "request_approved"),
        StatusCodeSeed::new("rejected", "Rejected", "request_rejected"),
    ]
}
