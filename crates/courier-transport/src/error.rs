//! Error types for the delivery pipeline and transport lifecycle.

use courier_runtime::{
    ConfigurationError, QueueError, SerializationError, TransactionError, ValidationError,
};
use thiserror::Error;

/// Errors surfaced by [`Transport`](crate::Transport) operations
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Queue operation failed: {0}")]
    Queue(#[from] QueueError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("Message serialization failed: {0}")]
    Serialization(#[from] SerializationError),

    #[error("No message serializer has been configured")]
    MissingSerializer,

    #[error("Transport has not been started")]
    NotStarted,

    #[error("Transport has already been started")]
    AlreadyStarted,
}

impl TransportError {
    /// Check if the failed operation may succeed when retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Queue(e) => e.is_transient(),
            Self::Transaction(e) => e.is_transient(),
            Self::Configuration(_)
            | Self::Serialization(_)
            | Self::MissingSerializer
            | Self::NotStarted
            | Self::AlreadyStarted => false,
        }
    }

    /// Configuration problems are reported at start and never retried
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::MissingSerializer
                | Self::Queue(QueueError::Configuration(_))
        )
    }
}

impl From<ValidationError> for TransportError {
    fn from(error: ValidationError) -> Self {
        Self::Queue(QueueError::Validation(error))
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
