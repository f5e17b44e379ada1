//! Error types for agentic-memory

use thiserror::Error;

/// Errors that can occur in the memory system
#[derive(Debug, Error)]
pub enum MemoryError {
    /// RocksDB error
    #[error("Storage error: {0}")]
    Storage(#[from] rocksdb::Error),

    /// Serialization error (bincode)
    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// UUID parsing error
    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Missing or malformed input
    #[error("Validation error: {0}")]
    Validation(String),

    /// A record violates the personal/group scoping rules
    #[error("Scope violation: {0}")]
    ScopeViolation(String),

    /// Summarizer failed; nothing was stored
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// Analyzer failed; the episode was still stored
    #[error("Partial extraction: {0}")]
    PartialExtraction(String),

    /// Propagation to a secondary index failed
    #[error("Sync error: {0}")]
    Sync(String),

    /// A retrieval backend could not answer
    #[error("Retrieval backend '{backend}' failed: {reason}")]
    RetrievalBackend { backend: String, reason: String },

    /// Retrieval exceeded its deadline
    #[error("Retrieval timed out after {0} ms")]
    Timeout(u64),

    /// The message was already memorized
    #[error("Duplicate message: {0}")]
    DuplicateMessage(String),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl MemoryError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a scope violation error
    pub fn scope(msg: impl Into<String>) -> Self {
        Self::ScopeViolation(msg.into())
    }

    /// Create an extraction error
    pub fn extraction(msg: impl Into<String>) -> Self {
        Self::Extraction(msg.into())
    }

    /// Create a sync error
    pub fn sync(msg: impl Into<String>) -> Self {
        Self::Sync(msg.into())
    }

    /// Create a retrieval backend error
    pub fn backend(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RetrievalBackend {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether the caller supplied bad input (as opposed to a system fault)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::ScopeViolation(_)
                | Self::DuplicateMessage(_)
                | Self::NotFound(_)
        )
    }
}

/// Result type for memory operations
pub type Result<T> = std::result::Result<T, MemoryError>;
