//! `hyperutils::error` is a module containing error utilities for the hyperbox project.

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a hyperutils-related operation.
pub type HyperutilsResult<T> = Result<T, HyperutilsError>;

/// An error that occurred in one of the shared utilities.
#[derive(pretty_error_debug::Debug, Error)]
pub enum HyperutilsError {
    /// An error that occurred when validating paths
    #[error("path validation error: {0}")]
    PathValidation(String),

    /// An error that occurred when parsing a transport socket address
    #[error("invalid socket address: {0}")]
    InvalidSocketAddress(String),

    /// The requested transport is not available on this platform
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// A connection could not be established before the deadline
    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),

    /// An error that occurred when performing an IO operation
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}
