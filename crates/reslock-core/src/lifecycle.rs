//! Application startup
//!
//! Components that need to run before traffic is accepted implement
//! [`Initializable`]. The [`Bootstrap`] runs them in registration order and
//! stops at the first failure; the caller only opens its listener once
//! [`Bootstrap::initialize_all`] returned `Ok`.
//!
//! # Example
//!
//! ```ignore
//! use reslock_core::lifecycle::Bootstrap;
//!
//! let stack = LockingStack::from_config(&config.locker).await?;
//! let bootstrap = Bootstrap::new().register(stack.sweep());
//!
//! bootstrap.initialize_all().await?;
//! // now accept connections
//! ```

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Something that must run once at startup
#[async_trait]
pub trait Initializable: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Prepare the component; an error aborts startup
    async fn initialize(&self) -> Result<()>;
}

/// Ordered list of startup participants
#[derive(Default)]
pub struct Bootstrap {
    participants: Vec<Arc<dyn Initializable>>,
}

impl Bootstrap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a participant; participants run in the order they were added
    pub fn register(mut self, participant: Arc<dyn Initializable>) -> Self {
        self.participants.push(participant);
        self
    }

    /// Number of registered participants
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Run every participant in order
    ///
    /// The first failure is returned as `Error::InitializationFailed` and the
    /// remaining participants are not run.
    pub async fn initialize_all(&self) -> Result<()> {
        let start = Instant::now();
        info!(participants = self.len(), "Starting initialization");

        for participant in &self.participants {
            let name = participant.name().to_string();
            if let Err(e) = participant.initialize().await {
                warn!(participant = %name, error = %e, "Initialization failed, aborting startup");
                return Err(match e {
                    already @ Error::InitializationFailed { .. } => already,
                    other => Error::InitializationFailed {
                        participant: name,
                        reason: other.to_string(),
                    },
                });
            }
            info!(participant = %name, "Initialized");
        }

        info!(
            elapsed_ms = start.elapsed().as_millis(),
            "Initialization complete"
        );
        Ok(())
    }
}

impl std::fmt::Debug for Bootstrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.participants.iter().map(|p| p.name().to_string()))
            .finish()
    }
}
