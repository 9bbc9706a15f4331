// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("RabbitMQ configuration error: {0}")]
    Configuration(String),

    #[error("Invalid argument: {0}")]
    Argument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("{0} has been disposed")]
    Disposed(&'static str),

    #[error("RabbitMQ transport error: {0}")]
    Transport(String),

    #[error("Message handler failed: {0}")]
    Handler(String),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] SerdeError),

    #[error("Message deserialization error: {0}")]
    Deserialization(String),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Timeout: {0}")]
    Timeout(String),
}

// Custom Result type for messaging operations
pub type Result<T> = std::result::Result<T, MessagingError>;

impl MessagingError {
    /// Whether this error describes a cooperative cancellation rather than a fault.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, MessagingError::Cancelled)
    }
}

// Every lapin failure is a connection or channel fault from our point of view;
// the managers repair them lazily on next access.
impl From<LapinError> for MessagingError {
    fn from(error: LapinError) -> Self {
        MessagingError::Transport(error.to_string())
    }
}

impl From<Elapsed> for MessagingError {
    fn from(_: Elapsed) -> Self {
        MessagingError::Timeout("operation timed out".to_string())
    }
}
