//! Simple username/password authentication.
//!
//! Credentials travel in frame metadata, either once on the `setup` frame
//! (connection principal) or on an individual request (request principal).
//! The store only answers "who is this"; route-level policy lives in
//! [`Router`](crate::router::Router).

use std::collections::HashMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{AppError, Result};

/// Username/password pair carried in request metadata.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    /// Account name.
    pub username: String,
    /// Plain-text password; only ever compared by digest.
    pub password: String,
}

impl Credentials {
    /// Construct a credential pair.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// An authenticated identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Principal {
    /// Account name.
    pub username: String,
    /// Granted roles.
    pub roles: Vec<String>,
}

impl Principal {
    /// Whether the principal holds `role`.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Account entry as configured under `[[users]]`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct User {
    /// Account name.
    pub username: String,
    /// Lower-case hex SHA-256 of the password.
    pub password_sha256: String,
    /// Granted roles.
    #[serde(default)]
    pub roles: Vec<String>,
}

impl User {
    /// Whether `password_sha256` is a well-formed digest.
    #[must_use]
    pub fn has_valid_digest(&self) -> bool {
        self.password_sha256.len() == 64
            && self.password_sha256.chars().all(|c| c.is_ascii_hexdigit())
    }
}

/// Lower-case hex SHA-256 digest of `password`.
#[must_use]
pub fn password_digest(password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());
    digest
        .iter()
        .fold(String::with_capacity(64), |mut out, byte| {
            let _ = write!(out, "{byte:02x}");
            out
        })
}

/// In-memory account registry.
#[derive(Debug, Clone, Default)]
pub struct UserStore {
    users: HashMap<String, User>,
}

impl UserStore {
    /// Build a store from configured users.
    #[must_use]
    pub fn new(users: impl IntoIterator<Item = User>) -> Self {
        Self {
            users: users
                .into_iter()
                .map(|user| (user.username.clone(), user))
                .collect(),
        }
    }

    /// Number of registered accounts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Whether no accounts are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Resolve credentials to a principal.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unauthorized` for unknown users or wrong passwords.
    /// Both cases produce the same message.
    pub fn authenticate(&self, credentials: &Credentials) -> Result<Principal> {
        let Some(user) = self.users.get(&credentials.username) else {
            return Err(AppError::Unauthorized("bad credentials".into()));
        };

        if !password_digest(&credentials.password).eq_ignore_ascii_case(&user.password_sha256) {
            return Err(AppError::Unauthorized("bad credentials".into()));
        }

        Ok(Principal {
            username: user.username.clone(),
            roles: user.roles.clone(),
        })
    }
}
