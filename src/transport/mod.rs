//! # Transport Layer
//!
//! Platform duplex streams behind a single named-endpoint API.
//!
//! ## Platforms
//! - **Windows**: named pipes (`\\.\pipe\<name>`) via `tokio::net::windows::named_pipe`
//! - **Unix**: Unix domain sockets at `<tmp>/<name>.sock`
//!
//! Everything above this module only sees [`DuplexStream`]s, so any
//! `AsyncRead + AsyncWrite` stream (for example `tokio::io::duplex`) can back a
//! connection.

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::MAX_ENDPOINT_LEN;
use crate::error::{IpcError, Result};

#[cfg(unix)]
mod local;
#[cfg(windows)]
mod windows_pipe;

#[cfg(unix)]
pub use local::{connect, PipeListener};
#[cfg(windows)]
pub use windows_pipe::{connect, PipeListener};

#[cfg(not(any(unix, windows)))]
compile_error!("pipe transport is only available on Unix and Windows");

/// A byte stream that can be both read and written
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased platform stream
pub type BoxedStream = Box<dyn DuplexStream>;

/// Resolves the caller identity of an accepted stream on first use
pub type IdentityResolver = Box<dyn FnOnce() -> Option<String> + Send>;

/// A stream produced by [`PipeListener::accept`]
pub struct Accepted {
    pub stream: BoxedStream,
    pub identity: Option<IdentityResolver>,
}

impl fmt::Debug for Accepted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accepted")
            .field("identity", &self.identity.is_some())
            .finish_non_exhaustive()
    }
}

/// Why an accept attempt failed
#[derive(Debug)]
pub enum AcceptError {
    /// One incoming connection failed; the listener keeps working
    Connection(io::Error),
    /// The listener itself is unusable
    Listener(io::Error),
}

impl fmt::Display for AcceptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceptError::Connection(e) => write!(f, "accept failed: {e}"),
            AcceptError::Listener(e) => write!(f, "listener failed: {e}"),
        }
    }
}

/// A named local endpoint servers listen on and clients connect to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    name: String,
}

impl Endpoint {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(IpcError::ConfigError("Endpoint name cannot be empty".into()));
        }
        if name.len() > MAX_ENDPOINT_LEN {
            return Err(IpcError::ConfigError(format!(
                "Endpoint name too long: {} characters (maximum: {MAX_ENDPOINT_LEN})",
                name.len()
            )));
        }
        if name.contains('\0') {
            return Err(IpcError::ConfigError(
                "Endpoint name cannot contain NUL characters".into(),
            ));
        }
        Ok(Self { name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Filesystem path of the Unix domain socket backing this endpoint
    ///
    /// Names containing a `/` are used as paths as-is.
    #[cfg(unix)]
    pub fn socket_path(&self) -> std::path::PathBuf {
        if self.name.contains('/') {
            std::path::PathBuf::from(&self.name)
        } else {
            std::env::temp_dir().join(format!("{}.sock", self.name))
        }
    }

    /// Full Windows pipe name for this endpoint
    ///
    /// Names already in `\\.\pipe\` form are used as-is; separators in bare
    /// names are flattened to underscores.
    #[cfg(windows)]
    pub fn pipe_name(&self) -> String {
        const PREFIX: &str = "\\\\.\\pipe\\";
        if self.name.starts_with(PREFIX) {
            return self.name.clone();
        }

        let name = self
            .name
            .trim_start_matches('/')
            .replace(['/', '\\'], "_");

        format!("{PREFIX}{name}")
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Access restrictions applied when a server creates its endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeSecurity {
    /// Unix: permission bits applied to the socket file
    pub unix_mode: Option<u32>,
    /// Windows: refuse connections from other machines
    pub reject_remote_clients: bool,
}

impl PipeSecurity {
    /// Only the owning user may connect
    pub fn owner_only() -> Self {
        Self {
            unix_mode: Some(0o600),
            reject_remote_clients: true,
        }
    }
}

impl Default for PipeSecurity {
    fn default() -> Self {
        Self {
            unix_mode: None,
            reject_remote_clients: true,
        }
    }
}
