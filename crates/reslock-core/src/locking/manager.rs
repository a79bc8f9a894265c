//! Read/write coordinator
//!
//! The coordinator is what the storage layer talks to. It turns a raw locker
//! into scoped execution:
//! - acquire the artifact for the resource in the requested mode
//! - run the protected operation
//! - release on every exit path (return, error, panic, cancellation)
//!
//! A release failure always wins: if the artifact was swept or expired while
//! the operation ran, the caller gets `LockError::Release` even though the
//! operation itself succeeded. An operation error replaced this way is still
//! logged alongside the release failure.

use super::handle::LockHandle;
use super::key::LockKey;
use super::locker::ResourceLocker;
use super::types::{LockError, LockMode, LockResult, ResourceIdentifier};
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default timeout for lock acquisition
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(6);

/// Releases the held lock if the scoped call is dropped mid-operation
struct InFlight {
    locker: Arc<dyn ResourceLocker>,
    handle: Option<LockHandle>,
}

impl InFlight {
    fn take(&mut self) -> LockResult<LockHandle> {
        self.handle
            .take()
            .ok_or_else(|| LockError::InvalidState("lock handle already taken".to_string()))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let locker = self.locker.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let key = handle.key().clone();
                    if let Err(e) = locker.release(handle).await {
                        warn!(lock_key = %key, error = %e, "Failed to release lock of cancelled operation");
                    }
                });
            }
            Err(_) => {
                warn!(lock = %handle, "Lock of cancelled operation left for the startup sweep");
            }
        }
    }
}

/// Scoped shared/exclusive locking over a [`ResourceLocker`]
#[derive(Clone)]
pub struct ReadWriteLocker {
    locker: Arc<dyn ResourceLocker>,
    timeout: Duration,
}

impl std::fmt::Debug for ReadWriteLocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadWriteLocker")
            .field("backend", &self.locker.backend())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ReadWriteLocker {
    /// Create a coordinator over the given locker
    pub fn new(locker: Arc<dyn ResourceLocker>) -> Self {
        Self {
            locker,
            timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    /// Set the acquisition timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Get the underlying locker
    pub fn locker(&self) -> &Arc<dyn ResourceLocker> {
        &self.locker
    }

    /// Run `operation` while holding a shared lock on `identifier`
    pub async fn with_read_lock<T, E, F, Fut>(
        &self,
        identifier: &ResourceIdentifier,
        operation: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError> + std::fmt::Display,
    {
        self.with_lock(identifier, LockMode::Read, operation).await
    }

    /// Run `operation` while holding an exclusive lock on `identifier`
    pub async fn with_write_lock<T, E, F, Fut>(
        &self,
        identifier: &ResourceIdentifier,
        operation: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError> + std::fmt::Display,
    {
        self.with_lock(identifier, LockMode::Write, operation).await
    }

    /// Run `operation` while holding a lock on `identifier` in `mode`
    ///
    /// ## Returns
    /// - the operation's result if acquire and release both succeeded
    /// - `LockError::Timeout` (converted into `E`) if the lock was not
    ///   obtained; the operation never ran
    /// - `LockError::Release` (converted into `E`) if the artifact was gone at
    ///   release time, whatever the operation returned
    pub async fn with_lock<T, E, F, Fut>(
        &self,
        identifier: &ResourceIdentifier,
        mode: LockMode,
        operation: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError> + std::fmt::Display,
    {
        let key = LockKey::encode(identifier, mode);
        let start = Instant::now();

        let handle = self.locker.acquire(&key, self.timeout).await.map_err(|e| {
            debug!(lock_key = %key, resource = %identifier, error = %e, "Lock not acquired");
            E::from(e)
        })?;
        debug!(
            lock_key = %key,
            resource = %identifier,
            mode = %mode,
            elapsed_ms = start.elapsed().as_millis(),
            "Running protected operation"
        );

        let mut in_flight = InFlight {
            locker: self.locker.clone(),
            handle: Some(handle),
        };
        let outcome = AssertUnwindSafe(async move { operation().await })
            .catch_unwind()
            .await;

        let released = match in_flight.take() {
            Ok(handle) => {
                let held_ms = handle.held_for().num_milliseconds();
                let released = self.locker.release(handle).await;
                debug!(lock_key = %key, held_ms, "Protected operation finished");
                released
            }
            Err(e) => Err(e),
        };

        match outcome {
            Err(panic) => {
                if let Err(e) = released {
                    warn!(lock_key = %key, error = %e, "Failed to release lock after panic");
                }
                std::panic::resume_unwind(panic)
            }
            Ok(result) => match (result, released) {
                (result, Ok(())) => result,
                (Ok(_), Err(e)) => {
                    warn!(lock_key = %key, error = %e, "Protected operation completed but its lock was lost");
                    Err(E::from(e))
                }
                (Err(failure), Err(e)) => {
                    warn!(
                        lock_key = %key,
                        error = %e,
                        operation_error = %failure,
                        "Protected operation failed and its lock was lost"
                    );
                    Err(E::from(e))
                }
            },
        }
    }
}
