//! Unified error taxonomy shared across all gateway control-plane crates.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy. Variant names carry semantic meaning for callers, not
/// implementation detail: `NotFound`/`Conflict` are routine and surfaced,
/// `Fatal` means the process must exit.
#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation error at {field}: {message}")]
    Validation { field: String, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("dependency error: {0}")]
    Dependency(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether this error is routine enough that a background task should
    /// just log it and keep going rather than propagate further.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Fatal(_))
    }
}
