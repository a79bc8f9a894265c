//! Error types for reslock

use crate::locking::LockError;
use thiserror::Error;

/// Result type alias using reslock's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Application-level errors with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Lock errors (E300-E399)
    #[error("{0}. The resource is busy, try again later.")]
    LockTimeout(LockError),

    #[error("{0}")]
    LockRelease(LockError),

    #[error(transparent)]
    Lock(LockError),

    // Startup errors (E400-E499)
    #[error("Initialization of '{participant}' failed: {reason}")]
    InitializationFailed { participant: String, reason: String },

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Generic errors
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::LockTimeout(e) | Self::LockRelease(e) | Self::Lock(e) => e.code(),
            Self::InitializationFailed { .. } => "E400",
            Self::ConfigError(_) => "E600",
            Self::Other(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::LockRelease(_) => Some(
                "The lock was removed while held (startup sweep, lease expiry or manual cleanup). Check `reslock list`."
                    .to_string(),
            ),
            Self::InitializationFailed { .. } => Some("reslock config list".to_string()),
            Self::ConfigError(_) => Some("reslock config path".to_string()),
            _ => None,
        }
    }

    /// Whether the caller may retry the request as-is
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::LockTimeout(_))
    }
}

impl From<LockError> for Error {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout { .. } => Self::LockTimeout(err),
            LockError::Release { .. } => Self::LockRelease(err),
            other => Self::Lock(other),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::ConfigError(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_lock_timeout_mapping() {
        let error = Error::from(LockError::timeout("abc.write", Duration::from_millis(5)));
        assert!(matches!(error, Error::LockTimeout(_)));
        assert_eq!(error.code(), "E300");
        assert!(error.is_transient());
        assert!(error.to_string().contains("try again later"));
    }

    #[test]
    fn test_lock_release_mapping() {
        let error = Error::from(LockError::release("abc.write", "lock no longer exists"));
        assert!(matches!(error, Error::LockRelease(_)));
        assert_eq!(error.code(), "E301");
        assert!(!error.is_transient());
        assert!(error.suggestion().is_some());
        assert!(error.to_string().contains("lock no longer exists"));
    }

    #[test]
    fn test_other_lock_errors_pass_through() {
        let error = Error::from(LockError::Backend("connection refused".to_string()));
        assert!(matches!(error, Error::Lock(_)));
        assert_eq!(error.code(), "E305");
        assert_eq!(error.suggestion(), None);
    }

    #[test]
    fn test_initialization_failed() {
        let error = Error::InitializationFailed {
            participant: "startup-sweep".to_string(),
            reason: "lock directory unreadable".to_string(),
        };
        assert_eq!(error.code(), "E400");
        assert!(error.to_string().contains("startup-sweep"));
    }
}
