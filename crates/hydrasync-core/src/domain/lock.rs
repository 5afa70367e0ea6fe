//! Remote lock records
//!
//! A `LockRecord` is created when a remote lock is acquired and persisted on
//! the local item inside its placeholder blob until release or expiry.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::LockToken;

/// How a lock came to be held by this client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Lock reported by the store but not taken by this client
    #[default]
    None,
    /// Taken automatically when a write handle was opened
    Auto,
    /// Taken by an explicit user request
    Manual,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockMode::None => "none",
            LockMode::Auto => "auto",
            LockMode::Manual => "manual",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    token: LockToken,
    owner: String,
    exclusive: bool,
    expires_at: Option<DateTime<Utc>>,
    mode: LockMode,
}

impl LockRecord {
    pub fn new(token: LockToken, owner: impl Into<String>, exclusive: bool) -> Self {
        Self {
            token,
            owner: owner.into(),
            exclusive,
            expires_at: None,
            mode: LockMode::None,
        }
    }

    #[must_use]
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: LockMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn token(&self) -> &LockToken {
        &self.token
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Expired records are treated as absent
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}
