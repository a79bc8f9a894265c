//! Per-resource read/write locking
//!
//! Storage operations on a resource are serialized through a lock keyed by
//! the resource identifier: many readers or one writer, never both.
//!
//! # Architecture
//!
//! - **Key Encoder**: `LockKey` maps a (resource, mode) pair to a
//!   backend-safe name
//! - **Lockers**: `ResourceLocker` implemented by `MemoryLocker`,
//!   `FileSystemLocker` and `RedisLocker`
//! - **Coordinator**: `ReadWriteLocker` runs an operation while holding a
//!   lock and always releases it afterwards
//! - **Startup Sweep**: `StartupSweep` clears locks left behind by a
//!   previous process before traffic is accepted
//!
//! Lock artifacts are never expired by age: a file marker of a crashed
//! process stays until the next startup sweep. Redis entries carry a lease as
//! a last resort.
//!
//! # Example
//!
//! ```ignore
//! use reslock_core::locking::{LockingStack, ResourceIdentifier};
//!
//! let stack = LockingStack::from_config(&config.locker).await?;
//! stack.sweep().run().await?;
//!
//! let id = ResourceIdentifier::new("http://localhost/container1/test.txt")?;
//! let body = stack
//!     .coordinator()
//!     .with_read_lock(&id, || async { store.read(&id).await })
//!     .await?;
//! ```

pub mod file;
pub mod handle;
pub mod key;
pub mod locker;
pub mod manager;
pub mod memory;
pub mod redis;
pub mod stack;
pub mod sweep;
pub mod types;

// Re-export main types
pub use self::file::FileSystemLocker;
pub use self::handle::LockHandle;
pub use self::key::LockKey;
pub use self::locker::{ResourceLocker, SweepReport};
pub use self::manager::{DEFAULT_ACQUIRE_TIMEOUT, ReadWriteLocker};
pub use self::memory::MemoryLocker;
pub use self::redis::RedisLocker;
pub use self::stack::{LockingStack, build_locker};
pub use self::sweep::StartupSweep;
pub use self::types::{
    BackendKind, LockError, LockMode, LockResult, ResourceIdentifier, RetryPolicy,
};
