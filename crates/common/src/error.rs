//! Common error types for llmpool
//!
//! This module defines all error types used across the coordinator and
//! worker processes. Errors that end a job are flattened into the job's
//! terminal record, so every variant renders a self-contained message.

use llmpool_proto::WireError;
use thiserror::Error;

/// Main error type for llmpool
#[derive(Error, Debug)]
pub enum LlmPoolError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed wire records
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Dial, write or read failures on a worker socket
    #[error("Connection error: {0}")]
    Connection(String),

    /// Failures reported by the inference engine
    #[error("Engine error: {0}")]
    Engine(String),

    /// Worker process could not be launched
    #[error("Spawn error: {0}")]
    Spawn(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// No worker slot can take a job
    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<WireError> for LlmPoolError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::InvalidRequest(msg) => LlmPoolError::invalid_input(msg),
            other => LlmPoolError::protocol(other.to_string()),
        }
    }
}

impl LlmPoolError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        LlmPoolError::Config(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        LlmPoolError::Protocol(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        LlmPoolError::Connection(msg.into())
    }

    /// Create an engine error
    pub fn engine(msg: impl Into<String>) -> Self {
        LlmPoolError::Engine(msg.into())
    }

    /// Create a spawn error
    pub fn spawn(msg: impl Into<String>) -> Self {
        LlmPoolError::Spawn(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        LlmPoolError::InvalidInput(msg.into())
    }

    /// Create a worker unavailable error
    pub fn worker_unavailable(msg: impl Into<String>) -> Self {
        LlmPoolError::WorkerUnavailable(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        LlmPoolError::Internal(msg.into())
    }
}

/// Result type alias for llmpool operations
pub type Result<T> = std::result::Result<T, LlmPoolError>;
