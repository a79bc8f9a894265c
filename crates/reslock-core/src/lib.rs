//! Reslock Core Library
//!
//! This crate provides per-resource read/write locking for a storage layer:
//! - Key encoding of resource identifiers
//! - In-memory, file-system and Redis lockers
//! - Scoped read/write execution with guaranteed release
//! - Startup sweep of locks left behind by a previous process
//! - File-backed configuration

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod locking;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::lifecycle::{Bootstrap, Initializable};
    pub use crate::locking::{
        LockError, LockMode, LockingStack, ReadWriteLocker, ResourceIdentifier, ResourceLocker,
        StartupSweep,
    };
}
