//! Startup sweep
//!
//! Lock artifacts left behind by a process that died while holding them
//! would block their resources forever. The sweep clears every artifact of
//! the configured backend once, before the application accepts requests.
//! It assumes no other process is using the same lock store at that point.

use super::locker::{ResourceLocker, SweepReport};
use super::types::LockResult;
use crate::error::Result;
use crate::lifecycle::Initializable;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Clears dangling lock artifacts at startup
#[derive(Clone)]
pub struct StartupSweep {
    locker: Arc<dyn ResourceLocker>,
}

impl StartupSweep {
    pub fn new(locker: Arc<dyn ResourceLocker>) -> Self {
        Self { locker }
    }

    /// Remove all lock artifacts of the backend
    ///
    /// Individual artifacts that cannot be removed are logged and counted in
    /// the report; only a failure to enumerate the store is an error. Running
    /// the sweep again is harmless.
    pub async fn run(&self) -> LockResult<SweepReport> {
        let start = Instant::now();
        let backend = self.locker.backend();
        let report = self.locker.sweep().await?;

        if report.failed > 0 {
            warn!(
                backend = %backend,
                removed = report.removed,
                failed = report.failed,
                "Startup sweep left artifacts behind"
            );
        } else {
            info!(
                backend = %backend,
                removed = report.removed,
                elapsed_ms = start.elapsed().as_millis(),
                "Startup sweep complete"
            );
        }
        Ok(report)
    }
}

impl std::fmt::Debug for StartupSweep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartupSweep")
            .field("backend", &self.locker.backend())
            .finish()
    }
}

#[async_trait]
impl Initializable for StartupSweep {
    fn name(&self) -> &str {
        "startup-sweep"
    }

    async fn initialize(&self) -> Result<()> {
        self.run().await?;
        Ok(())
    }
}
