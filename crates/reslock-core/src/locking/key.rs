//! Lock key encoding
//!
//! A [`LockKey`] is derived from a (resource, mode) pair. The resource part is
//! the hex SHA-256 of the identifier, so every key is a fixed-length string
//! that is legal as a file name and as a flat Redis key, and two identifiers
//! can only collide through a hash collision.

use super::types::{LockMode, ResourceIdentifier};
use sha2::{Digest, Sha256};
use std::fmt;

/// Backend-safe key for a (resource, mode) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    identifier: ResourceIdentifier,
    digest: String,
    mode: LockMode,
}

impl LockKey {
    /// Encode an identifier and mode into a lock key
    pub fn encode(identifier: &ResourceIdentifier, mode: LockMode) -> Self {
        Self {
            identifier: identifier.clone(),
            digest: digest(identifier),
            mode,
        }
    }

    /// Resource part of the key, shared by the read and write keys
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// The identifier this key was derived from
    pub fn identifier(&self) -> &ResourceIdentifier {
        &self.identifier
    }

    /// `<digest>.<mode>`
    pub fn name(&self) -> String {
        format!("{}.{}", self.digest, self.mode.as_str())
    }

    /// Key of the same resource in the other mode
    pub fn with_mode(&self, mode: LockMode) -> Self {
        Self {
            mode,
            ..self.clone()
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.digest, self.mode.as_str())
    }
}

fn digest(identifier: &ResourceIdentifier) -> String {
    hex::encode(Sha256::digest(identifier.as_str().as_bytes()))
}
