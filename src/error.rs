//! Error types for the session coordinator.

use std::io;
use thiserror::Error;

/// Result type for coordinator operations.
pub type Result<T> = std::result::Result<T, VncError>;

/// Errors that can occur in session coordinator operations.
#[derive(Debug, Error)]
pub enum VncError {
    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A caller passed an argument the coordinator cannot act on.
    /// Coordinator state is unchanged.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An internal invariant was violated; the coordinator cannot
    /// safely continue.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The desktop backend did not honour its start-up contract.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A per-client operation failed and the connection should be closed.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),
}
