//! Error types for the scheduler module

use std::fmt;

use crate::models::JobId;
use crate::store::StoreError;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Scheduler-specific errors
#[derive(Debug)]
pub enum SchedulerError {
    /// Job config or scheduler setting is malformed
    InvalidConfig { field: String, reason: String },

    /// A positional argument or operation input is malformed
    InvalidArgument { reason: String },

    /// A handler tried to resolve a job a second time
    AlreadyResolved { id: JobId, first: &'static str },

    /// The durable store failed
    Store(StoreError),
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig { field, reason } => {
                write!(f, "Invalid job config in '{}': {}", field, reason)
            }
            Self::InvalidArgument { reason } => {
                write!(f, "Invalid argument: {}", reason)
            }
            Self::AlreadyResolved { id, first } => {
                write!(f, "Job {} was already resolved with {}", id, first)
            }
            Self::Store(err) => {
                write!(f, "Store error: {}", err)
            }
        }
    }
}

impl std::error::Error for SchedulerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for SchedulerError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidArgument {
            reason: err.to_string(),
        }
    }
}

impl SchedulerError {
    /// Create an invalid config error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }
}
