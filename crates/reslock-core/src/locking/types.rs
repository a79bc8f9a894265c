//! Lock types and error definitions

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, sleep};

/// Result type for lock operations
pub type LockResult<T> = std::result::Result<T, LockError>;

/// Lock errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Lock acquisition did not succeed within the budget
    #[error("Lock timeout: could not acquire '{key}' within {waited_ms}ms")]
    Timeout { key: String, waited_ms: u64 },

    /// Release against a missing or mismatched artifact
    #[error("Failed to release lock '{key}': {reason}")]
    Release { key: String, reason: String },

    /// Identifier cannot be turned into a lock key
    #[error("Invalid lock key: {0}")]
    InvalidKey(String),

    /// Internal invariant violated
    #[error("Invalid lock state: {0}")]
    InvalidState(String),

    /// I/O error during lock operations
    #[error("Lock I/O error: {0}")]
    Io(String),

    /// External store error (connection, script failure, ...)
    #[error("Lock backend error: {0}")]
    Backend(String),
}

impl LockError {
    /// Get error code for this lock error
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "E300",
            Self::Release { .. } => "E301",
            Self::InvalidKey(_) => "E302",
            Self::InvalidState(_) => "E303",
            Self::Io(_) => "E304",
            Self::Backend(_) => "E305",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_release(&self) -> bool {
        matches!(self, Self::Release { .. })
    }

    pub(crate) fn release(key: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::Release {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn timeout(key: impl fmt::Display, waited: Duration) -> Self {
        Self::Timeout {
            key: key.to_string(),
            waited_ms: waited.as_millis() as u64,
        }
    }
}

impl From<std::io::Error> for LockError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(format!("Redis error: {}", err))
    }
}

/// Canonical name of a lockable resource
///
/// Canonicalization is the caller's job; two identifiers are the same
/// resource only if their strings are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceIdentifier(String);

impl ResourceIdentifier {
    pub fn new(path: impl Into<String>) -> LockResult<Self> {
        let path = path.into();
        if path.is_empty() {
            return Err(LockError::InvalidKey(
                "resource identifier must not be empty".to_string(),
            ));
        }
        Ok(Self(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for ResourceIdentifier {
    type Error = LockError;

    fn try_from(value: &str) -> LockResult<Self> {
        Self::new(value)
    }
}

/// Shared or exclusive access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Shared; any number of readers may hold concurrently
    Read,
    /// Exclusive; excludes readers and other writers
    Write,
}

impl LockMode {
    /// Convert to string representation (also the key suffix)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self, Self::Write)
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which backend a locker runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Single process, nothing persisted
    Memory,
    /// Marker files in a lock directory
    #[default]
    File,
    /// Keys in a Redis instance
    Redis,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::File => "file",
            Self::Redis => "redis",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = LockError;

    fn from_str(s: &str) -> LockResult<Self> {
        match s {
            "memory" => Ok(Self::Memory),
            "file" => Ok(Self::File),
            "redis" => Ok(Self::Redis),
            other => Err(LockError::InvalidState(format!(
                "unknown locker backend '{}' (expected memory, file or redis)",
                other
            ))),
        }
    }
}

/// Backoff used by lockers that have to poll a shared store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt
    pub initial_delay: Duration,

    /// Upper bound for the exponential delay (before jitter)
    pub max_delay: Duration,

    /// Random extra delay added to every wait, in `[0, jitter)`
    pub jitter: Duration,

    /// Attempt budget; `None` = bounded only by the timeout
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(25),
            max_delay: Duration::from_millis(500),
            jitter: Duration::from_millis(25),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Set the attempt budget
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Set the initial and maximum delay
    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max.max(initial);
        self
    }

    /// Whether another attempt is allowed after `attempts` failed ones
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts.map(|max| attempts < max).unwrap_or(true)
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);

        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
    }

    /// Sleep before the next attempt, or fail once the budget is spent
    pub(crate) async fn pause(
        &self,
        key: impl fmt::Display,
        attempts: u32,
        start: Instant,
        deadline: Instant,
    ) -> LockResult<()> {
        let now = Instant::now();
        if now >= deadline || !self.allows(attempts) {
            return Err(LockError::timeout(key, start.elapsed()));
        }
        sleep(self.delay_for(attempts).min(deadline - now)).await;
        Ok(())
    }
}
