//! Domain error model.

use std::fmt;

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// What kind of rule a [`DomainError`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Input that can never be accepted (unknown service, unknown status name)
    Validation,
    /// An operation that does not apply to the job as it stands
    Invariant,
    InvalidId,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Validation => "validation failed",
            ErrorKind::Invariant => "invariant violated",
            ErrorKind::InvalidId => "invalid identifier",
        })
    }
}

/// Failures a job can detect about itself without touching storage.
///
/// Storage, staging and processing failures are reported by the adapters'
/// own error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct DomainError {
    kind: ErrorKind,
    message: String,
}

impl DomainError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Invariant, message)
    }

    pub fn invalid_id(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidId, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The message without the kind prefix, for field-level reporting.
    pub fn message(&self) -> &str {
        &self.message
    }
}
