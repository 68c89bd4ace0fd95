//! Error types for the pipe bridge.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::bridge::Endpoint;

/// Result type alias using [`BridgeError`].
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Everything that can stop the bridge, during setup or inside the copy loop.
///
/// Each variant keeps the OS error as its source, so the rendered message
/// carries the same reason string `strerror` would give.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Invalid runtime configuration
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot create pipe '{}': {source}", path.display())]
    CreateFifo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot open pipe '{}' for writing: {source}", path.display())]
    OpenWriter {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot open pipe '{}' for reading: {source}", path.display())]
    OpenReader {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// stdin/stdout could not be duplicated or switched to non-blocking mode
    #[error("Cannot prepare {endpoint}: {source}")]
    Stdio {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("Error in poll: {0}")]
    Poll(#[source] io::Error),

    #[error("Error reading from {endpoint}: {source}")]
    Read {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("Error writing to {endpoint}: {source}")]
    Write {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    /// `poll` flagged the descriptor with `POLLERR` or `POLLNVAL`
    #[error("Error on {0}")]
    Fault(Endpoint),
}
