//! Unix domain socket backing for named endpoints.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, instrument};

use super::{AcceptError, Accepted, BoxedStream, Endpoint, PipeSecurity};
use crate::error::{IpcError, Result};

/// Listening side of an endpoint
///
/// The socket file is removed when the listener is dropped.
#[derive(Debug)]
pub struct PipeListener {
    listener: UnixListener,
    path: PathBuf,
}

impl PipeListener {
    /// Create the endpoint and start listening
    ///
    /// A leftover socket file from a dead server is replaced; a live one is
    /// reported as `AddrInUse`.
    #[instrument(skip(endpoint, security), fields(endpoint = %endpoint))]
    pub async fn bind(endpoint: &Endpoint, security: Option<&PipeSecurity>) -> Result<Self> {
        let path = endpoint.socket_path();

        if path.exists() {
            if UnixStream::connect(&path).await.is_ok() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("endpoint '{endpoint}' already has a listener"),
                )
                .into());
            }
            debug!(path = %path.display(), "Removing stale socket file");
            tokio::fs::remove_file(&path).await.ok();
        }

        let listener = UnixListener::bind(&path)?;

        if let Some(mode) = security.and_then(|s| s.unix_mode) {
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))?;
        }

        info!(path = %path.display(), "Listening on unix socket");
        Ok(Self { listener, path })
    }

    /// Wait for the next client
    pub async fn accept(&mut self) -> std::result::Result<Accepted, AcceptError> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .map_err(AcceptError::Connection)?;

        let credentials = stream.peer_cred().ok();
        let identity: super::IdentityResolver = Box::new(move || {
            credentials.map(|cred| match cred.pid() {
                Some(pid) => format!("uid={} gid={} pid={pid}", cred.uid(), cred.gid()),
                None => format!("uid={} gid={}", cred.uid(), cred.gid()),
            })
        });

        Ok(Accepted {
            stream: Box::new(stream),
            identity: Some(identity),
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl Drop for PipeListener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                error!(error = %e, path = %self.path.display(), "Failed to remove socket file");
            }
        } else {
            debug!(path = %self.path.display(), "Removed socket file");
        }
    }
}

/// Open a stream to `endpoint`, waiting while it does not exist yet
///
/// Loops until connected; callers bound the wait with a timeout.
#[instrument(skip(endpoint), fields(endpoint = %endpoint))]
pub async fn connect(endpoint: &Endpoint, poll_interval: Duration) -> Result<BoxedStream> {
    let path = endpoint.socket_path();

    loop {
        match UnixStream::connect(&path).await {
            Ok(stream) => {
                debug!(path = %path.display(), "Connected to unix socket");
                return Ok(Box::new(stream));
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound
                        | io::ErrorKind::ConnectionRefused
                        | io::ErrorKind::WouldBlock
                ) =>
            {
                tokio::time::sleep(poll_interval).await;
            }
            Err(e) => return Err(IpcError::endpoint_unavailable(endpoint.name(), e)),
        }
    }
}
