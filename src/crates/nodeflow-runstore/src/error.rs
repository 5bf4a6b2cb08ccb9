//! Error types for run-store and credential-store operations

use thiserror::Error;

/// Result type for run-store operations
pub type Result<T> = std::result::Result<T, RunStoreError>;

/// Errors that can occur while recording run history or loading
/// persistent state
#[derive(Error, Debug)]
pub enum RunStoreError {
    /// Run id does not exist in the backend
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Credential lookup failed (distinct from a clean "not found")
    #[error("Credential error for '{name}': {message}")]
    Credential {
        /// Credential name that was requested
        name: String,
        /// Backend error message
        message: String,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Custom error
    #[error("{0}")]
    Custom(String),
}
