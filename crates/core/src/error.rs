//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Failure of a job-record rule or of parsing a domain value.
///
/// Storage and transport failures have their own error types in the infra crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed object key).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A job record invariant would be violated (e.g. status regression).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (empty or containing a reserved separator).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A conflicting write was attempted (e.g. a second, different archive handle).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}
