//! Error types for mesh operations

use std::time::Duration;
use thiserror::Error;

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Errors that can occur during mesh operations
#[derive(Error, Debug)]
pub enum MeshError {
    /// Queue or buffer is at capacity
    #[error("Queue full: capacity {capacity}, current size {current}")]
    QueueFull { capacity: usize, current: usize },

    /// Message TTL elapsed before it could be accepted
    #[error("Message expired: {0}")]
    MessageExpired(String),

    /// Message failed structural validation
    #[error("Invalid message: {}", .0.join("; "))]
    InvalidMessage(Vec<String>),

    /// Agent has not been registered with the hub
    #[error("Agent not registered: {0}")]
    AgentNotRegistered(String),

    /// No direct handler, route, or broadcast handler accepted the message
    #[error("No handler for routing key: {0}")]
    NoRoute(String),

    /// A handler reported failure
    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    /// Operation timeout
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Queue persistence I/O failed
    #[error("Persistence failed: {0}")]
    Persistence(String),

    /// Message serialization failed
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Message deserialization failed
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MeshError {
    /// Shorthand for handler implementations reporting a failure
    pub fn handler(reason: impl Into<String>) -> Self {
        MeshError::HandlerFailed(reason.into())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            MeshError::DeserializationFailed(err.to_string())
        } else {
            MeshError::SerializationFailed(err.to_string())
        }
    }
}

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        MeshError::Persistence(err.to_string())
    }
}
