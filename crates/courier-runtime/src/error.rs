//! Error types for queue, pool and transaction operations.

use crate::transaction::TransactionId;
use std::time::Duration;
use thiserror::Error;

/// Comprehensive error type for all queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Connection to {destination} failed: {message}")]
    ConnectionFailed {
        destination: String,
        message: String,
    },

    #[error("Session for {destination} has been disconnected")]
    Disconnected { destination: String },

    #[error("Send to {destination} failed: {message}")]
    SendFailed {
        destination: String,
        message: String,
    },

    #[error("Receive from {destination} failed: {message}")]
    ReceiveFailed {
        destination: String,
        message: String,
    },

    #[error("Session operation '{operation}' failed: {message}")]
    SessionFailed { operation: String, message: String },

    #[error("Pool '{pool}' has been disposed")]
    PoolClosed { pool: String },

    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl QueueError {
    /// Check if error is transient and the operation may succeed when retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. } => true,
            Self::Disconnected { .. } => true,
            Self::SendFailed { .. } => true,
            Self::ReceiveFailed { .. } => true,
            Self::SessionFailed { .. } => true,
            Self::PoolClosed { .. } => false,
            Self::Transaction(e) => e.is_transient(),
            Self::Serialization(_) => false,
            Self::Configuration(_) => false,
            Self::Validation(_) => false,
        }
    }
}

/// Errors raised by the transaction coordinator
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Operation requires an ambient transaction but none was supplied")]
    NoAmbientTransaction,

    #[error("Transaction {id} has already completed")]
    AlreadyCompleted { id: TransactionId },

    #[error("Transaction {id} was aborted: {reason}")]
    Aborted { id: TransactionId, reason: String },

    #[error("Transaction {id} timed out after {elapsed:?} (limit {timeout:?})")]
    TimedOut {
        id: TransactionId,
        elapsed: Duration,
        timeout: Duration,
    },

    #[error("Transaction {id} outcome is in doubt: {reason}")]
    InDoubt { id: TransactionId, reason: String },
}

impl TransactionError {
    /// Aborted and timed out units of work can be replayed; misuse cannot.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Aborted { .. } | Self::TimedOut { .. })
    }
}

/// Errors during message encoding and decoding
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("Message body could not be serialized: {message}")]
    Encode { message: String },

    #[error("Message body could not be deserialized: {message}")]
    Decode { message: String },

    #[error("Message property '{key}' has invalid value")]
    InvalidProperty { key: String },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
