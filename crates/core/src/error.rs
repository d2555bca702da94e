//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type CoreResult<T> = Result<T, CoreError>;

/// Domain-level error.
///
/// Deterministic business failures only (validation, bad identifiers,
/// malformed configuration). Infrastructure failures belong to the
/// subsystem that hit them (`StorageError`, `JobStoreError`, `LockError`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// Configuration was malformed (bad env var, bad cron pattern, ...).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A requested resource was not found (domain-level).
    #[error("not found")]
    NotFound,
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
