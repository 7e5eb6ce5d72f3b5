//! # Windows Named Pipes Transport
//!
//! Named pipe backing for endpoints on Windows.
//!
//! The server keeps one unconnected pipe instance waiting at all times. When
//! a client connects, that instance is handed out and a fresh one is created
//! for the next client.

use std::io;
use std::time::Duration;

use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeServer, ServerOptions};
use tracing::{debug, error, info, instrument, warn};

use super::{AcceptError, Accepted, BoxedStream, Endpoint, PipeSecurity};
use crate::error::{IpcError, Result};

/// All pipe instances are busy
const ERROR_PIPE_BUSY: i32 = 231;

/// Listening side of an endpoint
#[derive(Debug)]
pub struct PipeListener {
    pipe_name: String,
    next: NamedPipeServer,
    security: PipeSecurity,
}

impl PipeListener {
    /// Create the first pipe instance for `endpoint`
    ///
    /// Fails if another server already owns the pipe name.
    #[instrument(skip(endpoint, security), fields(endpoint = %endpoint))]
    pub async fn bind(endpoint: &Endpoint, security: Option<&PipeSecurity>) -> Result<Self> {
        let pipe_name = endpoint.pipe_name();
        let security = security.copied().unwrap_or_default();
        if security.unix_mode.is_some() {
            warn!("Unix socket mode has no effect on named pipes");
        }

        let next = ServerOptions::new()
            .first_pipe_instance(true)
            .reject_remote_clients(security.reject_remote_clients)
            .create(&pipe_name)?;

        info!(pipe = %pipe_name, "Named pipe server listening");
        Ok(Self {
            pipe_name,
            next,
            security,
        })
    }

    fn create_instance(&self) -> io::Result<NamedPipeServer> {
        ServerOptions::new()
            .reject_remote_clients(self.security.reject_remote_clients)
            .create(&self.pipe_name)
    }

    /// Wait for the next client
    pub async fn accept(&mut self) -> std::result::Result<Accepted, AcceptError> {
        match self.next.connect().await {
            Ok(()) => {
                let fresh = self.create_instance().map_err(AcceptError::Listener)?;
                let connected = std::mem::replace(&mut self.next, fresh);
                Ok(Accepted {
                    stream: Box::new(connected),
                    identity: None,
                })
            }
            Err(e) => {
                error!(error = %e, "Error accepting pipe connection");
                match self.create_instance() {
                    Ok(fresh) => {
                        self.next = fresh;
                        debug!("Recreated server pipe after error");
                        Err(AcceptError::Connection(e))
                    }
                    Err(recreate_err) => {
                        error!(error = %recreate_err, "Failed to recreate server pipe");
                        Err(AcceptError::Listener(recreate_err))
                    }
                }
            }
        }
    }

    pub fn pipe_name(&self) -> &str {
        &self.pipe_name
    }
}

/// Open a pipe to `endpoint`, waiting while it is missing or busy
///
/// Loops until connected; callers bound the wait with a timeout.
#[instrument(skip(endpoint), fields(endpoint = %endpoint))]
pub async fn connect(endpoint: &Endpoint, poll_interval: Duration) -> Result<BoxedStream> {
    let pipe_name = endpoint.pipe_name();

    loop {
        match ClientOptions::new().open(&pipe_name) {
            Ok(client) => {
                info!(pipe = %pipe_name, "Connected to named pipe");
                return Ok(Box::new(client));
            }
            Err(e)
                if e.raw_os_error() == Some(ERROR_PIPE_BUSY)
                    || e.kind() == io::ErrorKind::NotFound =>
            {
                tokio::time::sleep(poll_interval).await;
            }
            Err(e) => return Err(IpcError::endpoint_unavailable(endpoint.name(), e)),
        }
    }
}
