//! Backend-agnostic locker trait

use super::handle::LockHandle;
use super::key::LockKey;
use super::types::{BackendKind, LockResult};
use async_trait::async_trait;
use std::time::Duration;

/// Outcome of clearing a backend's lock namespace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Artifacts removed
    pub removed: u32,

    /// Artifacts that could not be removed (logged and skipped)
    pub failed: u32,
}

impl SweepReport {
    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        match (self.removed, self.failed) {
            (0, 0) => "No dangling locks found".to_string(),
            (removed, 0) => format!("Removed {} dangling lock(s)", removed),
            (removed, failed) => format!(
                "Removed {} dangling lock(s), {} could not be removed",
                removed, failed
            ),
        }
    }
}

/// Raw lock primitive implemented by every backend
///
/// ## Behavior
/// - `acquire` creates the artifact for `key` in its mode, waiting at most
///   `timeout`. On failure nothing is left behind.
/// - `release` removes the artifact the handle refers to. A missing artifact
///   or one owned by another token is `LockError::Release`.
/// - `sweep` removes every artifact in the backend's namespace, whoever
///   created it. Only safe before the process serves traffic.
#[async_trait]
pub trait ResourceLocker: Send + Sync {
    /// Backend this locker runs on
    fn backend(&self) -> BackendKind;

    /// Acquire a lock on `key` within `timeout`
    ///
    /// ## Returns
    /// - `Ok(LockHandle)`: artifact created
    /// - `Err(LockError::Timeout)`: budget exhausted
    async fn acquire(&self, key: &LockKey, timeout: Duration) -> LockResult<LockHandle>;

    /// Release a held lock
    ///
    /// ## Returns
    /// - `Ok(())`: artifact removed
    /// - `Err(LockError::Release)`: artifact absent or owned by another token
    async fn release(&self, handle: LockHandle) -> LockResult<()>;

    /// Remove every artifact in this backend's namespace
    async fn sweep(&self) -> LockResult<SweepReport> {
        Ok(SweepReport::default())
    }

    /// Names of the artifacts currently visible in the namespace
    async fn artifacts(&self) -> LockResult<Vec<String>>;
}
