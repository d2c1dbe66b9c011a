//! Common error types for PromptLoop
//!
//! This module defines all error types used across the PromptLoop system.
//! All errors map to an HTTP status code so the scheduler surface can
//! render them without per-handler matching.

use axum::http::StatusCode;
use std::net::AddrParseError;
use thiserror::Error;

/// Main error type for PromptLoop
#[derive(Error, Debug)]
pub enum PromptLoopError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Model loading / unloading errors
    #[error("Model error: {0}")]
    Model(String),

    /// Inference requested against a model that is not resident
    #[error("Model {0} is not loaded")]
    ModelNotLoaded(String),

    /// Inference errors
    #[error("Inference error: {0}")]
    Inference(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Unknown task or worker
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request conflicts with current task state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Worker unavailable
    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// Worker registration rejected or unreachable
    #[error("Registration failed: {0}")]
    Registration(String),

    /// Backing store errors
    #[error("Store error: {0}")]
    Store(String),

    /// Parsing error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<AddrParseError> for PromptLoopError {
    fn from(err: AddrParseError) -> Self {
        PromptLoopError::Parse(err.to_string())
    }
}

impl PromptLoopError {
    /// Convert error to an HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            PromptLoopError::InvalidInput(_) | PromptLoopError::Parse(_) => {
                StatusCode::BAD_REQUEST
            }
            PromptLoopError::Serialization(_) => StatusCode::BAD_REQUEST,
            PromptLoopError::NotFound(_) => StatusCode::NOT_FOUND,
            PromptLoopError::Conflict(_) => StatusCode::CONFLICT,
            PromptLoopError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            PromptLoopError::Connection(_)
            | PromptLoopError::Http(_)
            | PromptLoopError::WorkerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            PromptLoopError::Config(_)
            | PromptLoopError::Model(_)
            | PromptLoopError::ModelNotLoaded(_)
            | PromptLoopError::Inference(_)
            | PromptLoopError::Io(_)
            | PromptLoopError::Registration(_)
            | PromptLoopError::Store(_)
            | PromptLoopError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            PromptLoopError::Timeout(_) | PromptLoopError::Connection(_) => true,
            PromptLoopError::Http(err) => {
                err.is_timeout()
                    || err.is_connect()
                    || err.status().map(|s| s.is_server_error()).unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        PromptLoopError::Config(msg.into())
    }

    /// Create a model error
    pub fn model(msg: impl Into<String>) -> Self {
        PromptLoopError::Model(msg.into())
    }

    /// Create an inference error
    pub fn inference(msg: impl Into<String>) -> Self {
        PromptLoopError::Inference(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        PromptLoopError::InvalidInput(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        PromptLoopError::NotFound(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        PromptLoopError::Conflict(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        PromptLoopError::Timeout(msg.into())
    }

    /// Create a worker unavailable error
    pub fn worker_unavailable(msg: impl Into<String>) -> Self {
        PromptLoopError::WorkerUnavailable(msg.into())
    }

    /// Create a registration error
    pub fn registration(msg: impl Into<String>) -> Self {
        PromptLoopError::Registration(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        PromptLoopError::Store(msg.into())
    }
}

/// Result type alias for PromptLoop operations
pub type Result<T> = std::result::Result<T, PromptLoopError>;
