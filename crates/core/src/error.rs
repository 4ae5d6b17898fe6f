//! Core error model.

use thiserror::Error;

/// Result type used by configuration and identifier parsing.
pub type CoreResult<T> = Result<T, CoreError>;

/// Error raised before any IO happens: malformed identifiers, invalid input,
/// or an inconsistent configuration.
///
/// Storage and transport failures have their own error types in the crates that
/// own those boundaries.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A value failed validation (e.g. empty topic name).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// Options or registrations are inconsistent.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
