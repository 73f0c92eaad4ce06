//! I/O manager error types

use std::os::unix::io::RawFd;

use thiserror::Error;

use super::state::IomgrState;

/// Manager and reactor layer errors
#[derive(Error, Debug)]
pub enum IomgrError {
    /// Standard IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation requires a different manager state
    #[error("IO manager is in state {0}, operation requires running")]
    NotRunning(IomgrState),

    /// Routed delivery found no live io thread
    #[error("no io threads available for message delivery")]
    NoIoThreads,

    /// Calling thread is not running an io loop
    #[error("calling thread is not an io thread")]
    NotIoThread,

    /// Raw descriptor has no registered record
    #[error("fd {0} is not registered with the IO manager")]
    UnknownFd(RawFd),
}

/// Result type for manager operations
pub type IomgrResult<T> = Result<T, IomgrError>;
