//! Unified error types for the enrichment pipeline.
//!
//! Storage error codes:
//! - STORE_001: transient write failure (I/O, network, connection)
//! - STORE_002: permanent write failure (schema, permission, rejected document)
//! - STORE_003: backend initialization failure

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Storage error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorCode {
    /// STORE_001: transient failure, safe to retry locally
    Transient,
    /// STORE_002: permanent failure, surfaced immediately
    Permanent,
    /// STORE_003: backend could not be initialized
    Init,
}

impl StorageErrorCode {
    /// Get the error code string.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transient => "STORE_001",
            Self::Permanent => "STORE_002",
            Self::Init => "STORE_003",
        }
    }
}

/// Unified error type for the enrichment pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage error with code and originating backend.
    #[error("[{code}] {backend}: {message}")]
    Storage {
        code: &'static str,
        backend: &'static str,
        message: String,
        transient: bool,
    },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("enrichment failed: {0}")]
    Enrichment(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a storage error for the given backend.
    pub fn storage(
        code: StorageErrorCode,
        backend: &'static str,
        msg: impl Into<String>,
    ) -> Self {
        Self::Storage {
            code: code.code(),
            backend,
            message: msg.into(),
            transient: code == StorageErrorCode::Transient,
        }
    }

    pub fn transient(backend: &'static str, msg: impl Into<String>) -> Self {
        Self::storage(StorageErrorCode::Transient, backend, msg)
    }

    pub fn permanent(backend: &'static str, msg: impl Into<String>) -> Self {
        Self::storage(StorageErrorCode::Permanent, backend, msg)
    }

    pub fn init(backend: &'static str, msg: impl Into<String>) -> Self {
        Self::storage(StorageErrorCode::Init, backend, msg)
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn enrichment(msg: impl Into<String>) -> Self {
        Self::Enrichment(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn queue(msg: impl Into<String>) -> Self {
        Self::Queue(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether a backend may retry the failed operation locally.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage { transient: true, .. })
    }

    /// Get the error code if this is a coded error.
    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            Self::Storage { code, .. } => Some(code),
            _ => None,
        }
    }
}
