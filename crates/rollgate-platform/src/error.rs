//! Errors reported by platform APIs.

use thiserror::Error;

/// Result type alias for platform calls.
pub type PlatformResult<T> = Result<T, PlatformError>;

/// Errors a platform API call can return.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    /// The stack already matches the requested template and parameters.
    #[error("no changes to apply")]
    NoChanges,

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("platform unavailable: {0}")]
    Unavailable(String),

    #[error("platform error: {0}")]
    Other(String),
}
