//! Core error types.

use thiserror::Error;

/// Errors raised while assembling routers and dispatchers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("no services registered")]
    NoServices,

    #[error("method already registered: {0}")]
    DuplicateMethod(String),

    #[error("invalid method url: {0}")]
    InvalidUrl(String),
}
