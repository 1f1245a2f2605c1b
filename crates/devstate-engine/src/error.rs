//! Error types for the engine.
//!
//! Every error carries a stable [`ErrorKind`] that front ends surface to
//! their callers unmodified.

use std::fmt;

use devstate_core::{ChainBreak, CoreError};
use devstate_store::StoreError;
use serde::Serialize;
use thiserror::Error;

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The state document, an entry or a snapshot artifact is missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// A document or request failed validation. Nothing was written.
    #[error("validation failed: {}", .errors.join("; "))]
    Validation { errors: Vec<String> },

    /// The writer hold could not be acquired in time, or the chain tail
    /// moved under a writer. Nothing was written.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    /// An imported snapshot does not verify.
    #[error("chain integrity violated: {reason}")]
    ChainIntegrity {
        /// Id of the offending entry, when the failure is tied to one.
        position: Option<u64>,
        reason: String,
    },

    /// Missing or inconsistent configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(StoreError),

    /// Snapshot file I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn validation(error: impl Into<String>) -> Self {
        EngineError::Validation {
            errors: vec![error.into()],
        }
    }

    /// A broken chain found while checking an import.
    pub fn chain_break(failure: ChainBreak) -> Self {
        EngineError::ChainIntegrity {
            position: Some(failure.position),
            reason: format!("{} at entry {}", failure.reason, failure.position),
        }
    }

    /// The stable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Validation { .. } => ErrorKind::Validation,
            EngineError::Concurrency(_) => ErrorKind::Concurrency,
            EngineError::ChainIntegrity { .. } => ErrorKind::ChainIntegrity,
            EngineError::Configuration(_) => ErrorKind::Configuration,
            EngineError::Store(_) | EngineError::Io(_) | EngineError::Serialization(_) => {
                ErrorKind::Storage
            }
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        if err.is_busy() {
            EngineError::Concurrency(err.to_string())
        } else {
            EngineError::Store(err)
        }
    }
}

impl From<CoreError> for EngineError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotAnObject(_) => EngineError::validation(err.to_string()),
            other => EngineError::Configuration(other.to_string()),
        }
    }
}

/// Stable error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    #[serde(rename = "NotFoundError")]
    NotFound,
    #[serde(rename = "ValidationError")]
    Validation,
    #[serde(rename = "ConcurrencyError")]
    Concurrency,
    #[serde(rename = "ChainIntegrityError")]
    ChainIntegrity,
    #[serde(rename = "ConfigurationError")]
    Configuration,
    #[serde(rename = "StorageError")]
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Concurrency => "ConcurrencyError",
            ErrorKind::ChainIntegrity => "ChainIntegrityError",
            ErrorKind::Configuration => "ConfigurationError",
            ErrorKind::Storage => "StorageError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
