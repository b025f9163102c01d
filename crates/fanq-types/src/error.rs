//! Error types for FanQ
//!
//! Defines all error types used throughout the application.

use thiserror::Error;

/// Main error type for FanQ operations
#[derive(Error, Debug)]
pub enum Error {
    /// Exchange not found
    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    /// Queue not found
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Message not found (unknown or already acknowledged)
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Queue already exists in the storage backend
    #[error("Queue already exists: {0}")]
    QueueAlreadyExists(String),

    /// Redeclare with parameters that differ from the existing entity
    #[error("Configuration conflict: {0}")]
    ConfigConflict(String),

    /// Second consumer on an exclusive queue, or access from a foreign connection
    #[error("Exclusivity violation: {0}")]
    ExclusivityViolation(String),

    /// Empty or otherwise unusable name
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// The connection was closed or lost
    #[error("Connection closed")]
    ConnectionClosed,

    /// No broker is reachable under the given host
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// A message handler reported a failure
    #[error("Handler error: {0}")]
    Handler(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error refers to an undeclared exchange, queue or message
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::ExchangeNotFound(_) | Error::QueueNotFound(_) | Error::MessageNotFound(_)
        )
    }
}

/// Result type alias for FanQ operations
pub type Result<T> = std::result::Result<T, Error>;
