//! Error types for webhook delivery operations.
//!
//! Delivery outcomes (rejections, connection faults, missing data) are not
//! errors here: they travel as [`crate::worker::DeliverySignal`] values. What
//! remains are faults of the surrounding infrastructure that the caller must
//! handle, chiefly persistence failures.

use std::{fmt, time::Duration};

use courier_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Infrastructure failures raised by the delivery crate.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Data store lookup or write failed.
    ///
    /// Never a delivery failure: the attempt (if any) must not be counted.
    #[error("persistence error: {message}")]
    Persistence {
        /// Store error message
        message: String,
    },

    /// Job queue operation failed.
    #[error("job queue error: {message}")]
    Queue {
        /// Queue error message
        message: String,
    },

    /// Invalid client or engine configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Workers did not stop within the shutdown timeout.
    #[error("worker shutdown timed out after {}s", timeout.as_secs())]
    ShutdownTimeout {
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Index of the failed worker
        worker_id: usize,
        /// Join error description
        error: String,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    Internal {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a persistence error.
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence { message: message.into() }
    }

    /// Creates a job queue error.
    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(error: CoreError) -> Self {
        Self::persistence(error.to_string())
    }
}

/// Category of delivery error, attached to runner error logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Data store or queue.
    Storage,
    /// Configuration problems.
    Configuration,
    /// Worker lifecycle.
    Lifecycle,
    /// Internal system errors.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::Persistence { .. } | DeliveryError::Queue { .. } => Self::Storage,
            DeliveryError::Configuration { .. } => Self::Configuration,
            DeliveryError::ShutdownTimeout { .. } | DeliveryError::WorkerPanic { .. } => {
                Self::Lifecycle
            },
            DeliveryError::Internal { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage => write!(f, "storage"),
            Self::Configuration => write!(f, "configuration"),
            Self::Lifecycle => write!(f, "lifecycle"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_become_persistence_faults() {
        let error = DeliveryError::from(CoreError::Database("pool timed out".to_string()));

        assert!(matches!(error, DeliveryError::Persistence { .. }));
        assert!(error.to_string().contains("pool timed out"));
    }

    #[test]
    fn error_categories_mapped_correctly() {
        assert_eq!(ErrorCategory::from(&DeliveryError::persistence("x")), ErrorCategory::Storage);
        assert_eq!(ErrorCategory::from(&DeliveryError::queue("x")), ErrorCategory::Storage);
        assert_eq!(
            ErrorCategory::from(&DeliveryError::configuration("x")),
            ErrorCategory::Configuration
        );
        assert_eq!(
            ErrorCategory::from(&DeliveryError::ShutdownTimeout {
                timeout: Duration::from_secs(30)
            }),
            ErrorCategory::Lifecycle
        );
        assert_eq!(ErrorCategory::Storage.to_string(), "storage");
    }

    #[test]
    fn error_display_format() {
        let error = DeliveryError::ShutdownTimeout { timeout: Duration::from_secs(30) };
        assert_eq!(error.to_string(), "worker shutdown timed out after 30s");

        let panic = DeliveryError::WorkerPanic { worker_id: 2, error: "boom".to_string() };
        assert_eq!(panic.to_string(), "worker 2 panicked: boom");
    }
}
