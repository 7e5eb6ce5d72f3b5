//! # Error Types
//!
//! Error handling for the pipe messaging transport.
//!
//! Every failure that can happen while connecting, framing, encoding or
//! writing is expressed as an [`IpcError`] variant.
//!
//! ## Error Categories
//! - **I/O Errors**: broken pipes, resets, failed reads and writes
//! - **Connect Errors**: timeouts and unavailable endpoints
//! - **Serialization Errors**: codec failures and oversized frames
//! - **Discipline Errors**: re-entrant writes and invalid state transitions
//! - **Cancellation**: caller-requested aborts
//!
//! `IpcError` is `Clone`: the same error value is returned to the caller of a
//! failed write and published as an `Exception` event on the connection.
//!
//! ## Example Usage
//! ```rust
//! use pipe_messaging::error::{IpcError, Result};
//! use std::fs::File;
//! use std::io::Read;
//! use tracing::{error, info};
//!
//! fn read_file(path: &str) -> Result<String> {
//!     let mut file = File::open(path)?;
//!     let mut contents = String::new();
//!     file.read_to_string(&mut contents)?;
//!     Ok(contents)
//! }
//!
//! fn main() {
//!     match read_file("example.txt") {
//!         Ok(contents) => info!(contents, "Successfully read file"),
//!         Err(IpcError::Io(e)) => error!(error = %e, "I/O error reading file"),
//!         Err(e) => error!(error = %e, "Error reading file"),
//!     }
//! }
//! ```

use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Connection errors
    pub const ERR_ALREADY_STARTED: &str = "Connection already started";
    pub const ERR_ALREADY_CONNECTED: &str = "Client is already connected or connecting";
    pub const ERR_SERVER_RUNNING: &str = "Server is already running";

    /// Write discipline errors
    pub const ERR_REENTRANT_WRITE: &str =
        "Re-entrant write detected while the write lock is held by the same task";
    pub const ERR_WRITE_MID_FRAME: &str = "Write interrupted after part of a frame was sent";

    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";
}

/// Primary error type for all transport operations
#[derive(Error, Debug, Clone)]
pub enum IpcError {
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    #[error("Timed out after {timeout:?} connecting to endpoint '{endpoint}'")]
    ConnectTimeout { endpoint: String, timeout: Duration },

    #[error("Endpoint '{endpoint}' unavailable: {source}")]
    EndpointUnavailable {
        endpoint: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Frame too large: {0} bytes")]
    OversizedFrame(usize),

    #[error("Re-entrant write detected")]
    Reentrancy,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<io::Error> for IpcError {
    fn from(err: io::Error) -> Self {
        IpcError::Io(Arc::new(err))
    }
}

impl From<bincode::Error> for IpcError {
    fn from(err: bincode::Error) -> Self {
        IpcError::Serialization(err.to_string())
    }
}

impl IpcError {
    /// Wrap an I/O error that happened while connecting to `endpoint`
    pub fn endpoint_unavailable(endpoint: impl Into<String>, source: io::Error) -> Self {
        IpcError::EndpointUnavailable {
            endpoint: endpoint.into(),
            source: Arc::new(source),
        }
    }

    /// Whether this error means the peer went away (broken pipe, reset, EOF)
    pub fn is_broken_pipe(&self) -> bool {
        match self {
            IpcError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ),
            IpcError::ConnectionClosed => true,
            _ => false,
        }
    }

    /// Whether the stream position can no longer be trusted after this error
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            IpcError::Io(_)
                | IpcError::Serialization(_)
                | IpcError::OversizedFrame(_)
                | IpcError::Reentrancy
                | IpcError::ConnectionClosed
        )
    }
}

/// Type alias for Results using IpcError
pub type Result<T> = std::result::Result<T, IpcError>;
