#![forbid(unsafe_code)]

//! Engine error taxonomy and the crate-wide `Result` alias.

use std::fmt;
use std::io;

use thiserror::Error;

/// Convenience alias for fallible engine operations.
pub type Result<T> = std::result::Result<T, KgError>;

/// Errors surfaced by the query engine.
///
/// Backend failures are classified before they reach callers so a service
/// layer can tell a malformed statement apart from a resource ceiling or a
/// transient outage.
#[derive(Debug, Error)]
pub enum KgError {
    /// The submitted query specification is malformed.
    #[error("invalid query specification: {0}")]
    Validation(String),
    /// The backend rejected the compiled statement.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
    /// The statement exceeded the backend memory ceiling.
    #[error("Query size limit exceeded: {0}")]
    LimitExceeded(String),
    /// The caller lacks the permission required for the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// A backend call failed in a way that may succeed when retried.
    #[error("transient backend failure: {0}")]
    TransientBackend(String),
    /// The backend stayed unreachable after every retry.
    #[error("backend unavailable after {attempts} attempts: {reason}")]
    BackendUnavailable {
        /// Number of attempts made before giving up.
        attempts: u32,
        /// Message of the last failure.
        reason: String,
    },
    /// A referenced entity does not exist.
    #[error("{0} not found")]
    NotFound(String),
    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// JSON decoding or encoding failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

impl KgError {
    /// Builds a [`KgError::Validation`] from any message.
    pub fn validation(msg: impl Into<String>) -> Self {
        KgError::Validation(msg.into())
    }

    /// Builds a [`KgError::InvalidQuery`] from any message.
    pub fn invalid_query(msg: impl Into<String>) -> Self {
        KgError::InvalidQuery(msg.into())
    }

    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            KgError::Validation(_) => "Validation",
            KgError::InvalidQuery(_) => "InvalidQuery",
            KgError::LimitExceeded(_) => "LimitExceeded",
            KgError::Forbidden(_) => "Forbidden",
            KgError::TransientBackend(_) => "TransientBackend",
            KgError::BackendUnavailable { .. } => "BackendUnavailable",
            KgError::NotFound(_) => "NotFound",
            KgError::Io(_) => "Io",
            KgError::Json(_) => "Json",
            KgError::Config(_) => "Config",
        }
    }

    /// Whether the failure may go away on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KgError::TransientBackend(_))
    }
}

/// Formats an error prefixed with its code, e.g. `[Validation] ...`.
pub struct KgErrorWithCode<'a>(pub &'a KgError);

impl fmt::Display for KgErrorWithCode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.0.code(), self.0)
    }
}
