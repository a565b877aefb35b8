//! Error types for ChatReflex.
//!
//! Errors are strongly typed using thiserror. Only the synchronous admin-facing
//! operations (adding/removing triggers and schedules, configuration) surface
//! these to callers; background units log and swallow their failures.

use thiserror::Error;

use crate::storage::StorageError;

/// Validation errors raised at the call boundary.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Pattern cannot be empty")]
    EmptyPattern,

    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        pattern: String,
        reason: String,
    },

    #[error("Interval must be a positive number of minutes (got {minutes})")]
    NonPositiveInterval {
        minutes: i64,
    },

    #[error("Invalid configuration for '{field}': {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },
}

/// Execution errors that occur while running an operation.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Storage error: {message}")]
    Storage {
        message: String,
    },

    #[error("Queue '{path}' is full (capacity {capacity})")]
    QueueFull {
        path: String,
        capacity: usize,
    },

    #[error("Worker '{path}' is disconnected")]
    Disconnected {
        path: String,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },
}

/// Failure to deliver a reply or alert through the host transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("delivery failed: {message}")]
pub struct DeliveryError {
    /// Human-readable reason.
    pub message: String,
}

impl DeliveryError {
    /// Creates a delivery error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Top-level error type for ChatReflex.
#[derive(Debug, Error)]
pub enum ReflexError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl From<StorageError> for ReflexError {
    fn from(err: StorageError) -> Self {
        Self::Execution(ExecutionError::Storage {
            message: err.to_string(),
        })
    }
}

impl ReflexError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) => false,
            Self::Execution(e) => matches!(
                e,
                ExecutionError::Timeout { .. }
                    | ExecutionError::QueueFull { .. }
                    | ExecutionError::Storage { .. }
            ),
            Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for ChatReflex operations.
pub type ReflexResult<T> = Result<T, ReflexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_interval() {
        let err = ValidationError::NonPositiveInterval { minutes: 0 };
        let msg = format!("{err}");
        assert!(msg.contains("positive"));
        assert!(msg.contains('0'));
    }

    #[test]
    fn test_validation_error_pattern() {
        let err = ValidationError::InvalidPattern {
            pattern: "(".to_string(),
            reason: "unclosed group".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("unclosed group"));
    }

    #[test]
    fn test_execution_error_queue_full() {
        let err = ExecutionError::QueueFull {
            path: "match".to_string(),
            capacity: 16,
        };
        let msg = format!("{err}");
        assert!(msg.contains("match"));
        assert!(msg.contains("16"));
    }

    #[test]
    fn test_reflex_error_from_validation() {
        let err: ReflexError = ValidationError::EmptyPattern.into();
        assert!(err.is_validation());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_reflex_error_from_storage() {
        let err: ReflexError = StorageError::BackendError("disk full".to_string()).into();
        assert!(err.is_execution());
        assert!(err.is_retryable());
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_reflex_error_internal() {
        let err = ReflexError::internal("unexpected state");
        assert!(err.is_internal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_disconnected_not_retryable() {
        let err: ReflexError = ExecutionError::Disconnected {
            path: "telemetry".to_string(),
        }
        .into();
        assert!(!err.is_retryable());
    }
}
