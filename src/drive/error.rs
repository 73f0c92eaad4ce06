//! Drive interface error types

use thiserror::Error;

/// Errors surfaced by the synchronous drive paths and device setup.
///
/// Asynchronous submissions never return errors directly: failures arrive
/// through the completion callback as negative errno results.
#[derive(Error, Debug)]
pub enum DriveError {
    /// Standard IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation not supported
    #[error("operation not supported: {0}")]
    NotSupported(String),
}

/// Result type for drive operations
pub type DriveResult<T> = Result<T, DriveError>;
