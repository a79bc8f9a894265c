//! Composition root for the locking subsystem
//!
//! Picks the backend named in the configuration and wires one locker
//! instance into both the coordinator and the startup sweep, so the two
//! always operate on the same store.

use super::file::FileSystemLocker;
use super::locker::ResourceLocker;
use super::manager::ReadWriteLocker;
use super::memory::MemoryLocker;
use super::redis::RedisLocker;
use super::sweep::StartupSweep;
use super::types::{BackendKind, LockResult};
use crate::config::LockerConfig;
use std::sync::Arc;
use tracing::info;

/// Locker, coordinator and sweep sharing one backend
#[derive(Debug, Clone)]
pub struct LockingStack {
    coordinator: ReadWriteLocker,
    sweep: Arc<StartupSweep>,
}

impl LockingStack {
    /// Build the stack over an existing locker
    pub fn new(locker: Arc<dyn ResourceLocker>, config: &LockerConfig) -> Self {
        Self {
            coordinator: ReadWriteLocker::new(locker.clone())
                .with_timeout(config.acquire_timeout()),
            sweep: Arc::new(StartupSweep::new(locker)),
        }
    }

    /// Build the stack for the configured backend
    ///
    /// Connects to Redis when that backend is selected; the other backends
    /// are constructed without touching their store.
    pub async fn from_config(config: &LockerConfig) -> LockResult<Self> {
        let locker = build_locker(config).await?;
        info!(
            backend = %config.backend,
            acquire_timeout_ms = config.acquire_timeout_ms,
            "Locking stack ready"
        );
        Ok(Self::new(locker, config))
    }

    pub fn coordinator(&self) -> &ReadWriteLocker {
        &self.coordinator
    }

    pub fn locker(&self) -> &Arc<dyn ResourceLocker> {
        self.coordinator.locker()
    }

    /// The sweep, ready to register with a [`crate::lifecycle::Bootstrap`]
    pub fn sweep(&self) -> Arc<StartupSweep> {
        self.sweep.clone()
    }
}

/// Create the locker selected by `config.backend`
pub async fn build_locker(config: &LockerConfig) -> LockResult<Arc<dyn ResourceLocker>> {
    let retry = config.retry.policy();
    let locker: Arc<dyn ResourceLocker> = match config.backend {
        BackendKind::Memory => Arc::new(MemoryLocker::new()),
        BackendKind::File => {
            Arc::new(FileSystemLocker::new(config.file.lock_dir.clone()).with_retry(retry))
        }
        BackendKind::Redis => Arc::new(
            RedisLocker::connect(&config.redis.url, config.redis.namespace.clone())
                .await?
                .with_lease(config.lease())
                .with_retry(retry),
        ),
    };
    Ok(locker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileConfig;
    use crate::locking::types::ResourceIdentifier;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_stack() {
        let config = LockerConfig {
            backend: BackendKind::Memory,
            acquire_timeout_ms: 150,
            ..LockerConfig::default()
        };
        let stack = LockingStack::from_config(&config).await.unwrap();

        assert_eq!(stack.locker().backend(), BackendKind::Memory);
        assert_eq!(stack.coordinator().timeout(), Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_file_stack_shares_one_store() {
        let temp = TempDir::new().unwrap();
        let config = LockerConfig {
            backend: BackendKind::File,
            file: FileConfig {
                lock_dir: temp.path().join("locks"),
            },
            ..LockerConfig::default()
        };
        let stack = LockingStack::from_config(&config).await.unwrap();
        let resource = ResourceIdentifier::new("doc").unwrap();

        stack.sweep().run().await.unwrap();
        let seen = stack
            .coordinator()
            .with_write_lock(&resource, || async {
                stack.locker().artifacts().await
            })
            .await
            .unwrap();

        assert_eq!(seen.len(), 1);
        assert!(seen[0].ends_with(".write"));
        assert!(stack.locker().artifacts().await.unwrap().is_empty());
    }
}
