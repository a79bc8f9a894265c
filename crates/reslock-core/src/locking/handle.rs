//! Lock handles
//!
//! A handle proves a successful acquisition. It is owned by exactly one
//! caller and consumed by [`ResourceLocker::release`](super::ResourceLocker::release).
//! The backend artifact stays authoritative: a handle whose artifact was
//! swept or expired fails to release.

use super::key::LockKey;
use super::types::LockMode;
use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

/// Token for a held lock
#[derive(Debug, PartialEq, Eq)]
pub struct LockHandle {
    /// Key the artifact was created under
    key: LockKey,

    /// Unique per acquisition; proves ownership on release
    token: Uuid,

    /// When the lock was acquired
    acquired_at: DateTime<Utc>,
}

impl LockHandle {
    /// Create a handle for a freshly created artifact
    pub(crate) fn new(key: LockKey, token: Uuid) -> Self {
        Self {
            key,
            token,
            acquired_at: Utc::now(),
        }
    }

    pub fn key(&self) -> &LockKey {
        &self.key
    }

    pub fn mode(&self) -> LockMode {
        self.key.mode()
    }

    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// How long the lock has been held so far
    pub fn held_for(&self) -> chrono::Duration {
        Utc::now() - self.acquired_at
    }
}

impl fmt::Display for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lock[{}#{}]", self.key, self.token)
    }
}
