//! Error types for the agentic memory server.

use agentic_memory::MemoryError;
use thiserror::Error;

/// Errors that can occur while serving a request.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Whether the caller sent a bad request rather than hitting a fault
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::InvalidRequest(_) | Self::Json(_) => true,
            Self::Memory(err) => err.is_client_error(),
            Self::Io(_) => false,
        }
    }
}

/// Result type alias for server operations.
pub type ServerResult<T> = Result<T, ServerError>;
