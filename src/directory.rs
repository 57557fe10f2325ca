//! User identity lookups. The directory itself lives outside this crate.
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::error::RequestError;
use crate::utils::{new_uuid_to_bech32, strip_domain};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub username: String, // as known to the directory, possibly qualified
    pub email: Option<String>,
    pub name: Option<String>,
}

#[derive(thiserror::Error, Debug)]
#[error("user directory lookup failed for {username}: {reason}")]
pub struct DirectoryError {
    pub username: String,
    pub reason: String,
}

pub trait UserDirectory: Send + Sync {
    /// Looks up a user by qualified username. `None` means the user does not exist.
    fn find_user(&self, username: &str) -> Result<Option<User>, DirectoryError>;
}

/// A directory held in memory, handy for tests and small deployments.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    users: RwLock<HashMap<String, User>>,
}

impl User {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            email: None,
            name: None,
        }
    }

    pub fn with_email(mut self, email: &str) -> Self {
        self.email = Some(email.to_string());
        self
    }

    pub fn bare_username(&self) -> &str {
        strip_domain(&self.username)
    }
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a user under a fresh id and returns it.
    pub fn add_user(&self, username: &str, email: Option<&str>) -> Result<User, RequestError> {
        let mut user = User::new(new_uuid_to_bech32("user_")?, username);
        user.email = email.map(str::to_string);
        self.insert(user.clone());
        Ok(user)
    }

    pub fn insert(&self, user: User) {
        self.users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user.username.clone(), user);
    }
}

impl UserDirectory for InMemoryDirectory {
    fn find_user(&self, username: &str) -> Result<Option<User>, DirectoryError> {
        Ok(self
            .users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(username)
            .cloned())
    }
}
