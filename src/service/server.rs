//! # Server
//!
//! Listens on a named endpoint, accepts any number of clients and tracks the
//! active connection set.
//!
//! ## Accept loop
//! - A failed accept of one client is reported as an `Exception` with no
//!   connection and the loop keeps accepting
//! - A failure of the listener itself ends the loop
//! - Connections beyond `max_connections` are closed immediately
//!
//! A connection leaves the active set before its `ClientDisconnected` event is
//! emitted.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::connection::{Connection, ConnectionId};
use super::events::{self, ConnectionEvent, EventSender, EventStream, ServerEvent};
use crate::config::{IpcConfig, ServerConfig};
use crate::core::codec::MessageCodec;
use crate::core::frame::FrameCodec;
use crate::error::constants::ERR_SERVER_RUNNING;
use crate::error::{IpcError, Result};
use crate::transport::{AcceptError, Accepted, Endpoint, PipeListener, PipeSecurity};
use crate::utils::metrics::global_metrics;

/// Pause after a failed accept before trying again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Poll interval while waiting for connections to drain on shutdown
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

type ConnectionMap<T> = Mutex<HashMap<ConnectionId, Connection<T>>>;

struct ServerShared<T> {
    codec: Arc<dyn MessageCodec<T>>,
    config: ServerConfig,
    frame_codec: FrameCodec,
    connections: ConnectionMap<T>,
    events: EventSender<ServerEvent<T>>,
    shutdown: CancellationToken,
    running: AtomicBool,
    endpoint: Mutex<Option<Endpoint>>,
}

/// Multi-client server on one named endpoint
pub struct Server<T: Send + 'static> {
    inner: Arc<ServerShared<T>>,
}

impl<T: Send + 'static> fmt::Debug for Server<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("running", &self.inner.running.load(Ordering::Acquire))
            .field("max_connections", &self.inner.config.max_connections)
            .finish_non_exhaustive()
    }
}

impl<T> Server<T>
where
    T: Send + 'static,
{
    /// Create a server and the stream of its events
    pub fn new<C>(codec: C, config: &IpcConfig) -> (Self, EventStream<ServerEvent<T>>)
    where
        C: MessageCodec<T>,
    {
        let (events, stream) = events::channel();
        let server = Self {
            inner: Arc::new(ServerShared {
                codec: Arc::new(codec),
                config: config.server.clone(),
                frame_codec: FrameCodec::with_max_payload(config.transport.max_payload_size),
                connections: Mutex::new(HashMap::new()),
                events,
                shutdown: CancellationToken::new(),
                running: AtomicBool::new(false),
                endpoint: Mutex::new(None),
            }),
        };
        (server, stream)
    }

    /// Bind `endpoint` and start accepting clients
    ///
    /// Binding errors are returned; once bound, failures are reported as
    /// events. Must be called from within a tokio runtime.
    #[instrument(skip(self, endpoint, security), fields(endpoint = %endpoint))]
    pub async fn start(&self, endpoint: &str, security: Option<PipeSecurity>) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(IpcError::InvalidState("server has been disposed"));
        }
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(IpcError::InvalidState(ERR_SERVER_RUNNING));
        }

        let bound = match Endpoint::new(endpoint) {
            Ok(endpoint) => PipeListener::bind(&endpoint, security.as_ref())
                .await
                .map(|listener| (endpoint, listener)),
            Err(e) => Err(e),
        };
        let (endpoint, listener) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                self.inner.running.store(false, Ordering::Release);
                error!(error = %e, "Failed to bind endpoint");
                return Err(e);
            }
        };

        if let Ok(mut slot) = self.inner.endpoint.lock() {
            *slot = Some(endpoint.clone());
        }

        let (connection_events, connection_rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_loop(Arc::clone(&self.inner), connection_rx));
        tokio::spawn(accept_loop(
            Arc::clone(&self.inner),
            endpoint,
            listener,
            connection_events,
        ));

        info!(max_connections = self.inner.config.max_connections, "Server started");
        Ok(())
    }

    /// Start on the endpoint named in the configuration
    pub async fn start_configured(&self, security: Option<PipeSecurity>) -> Result<()> {
        let endpoint = self.inner.config.endpoint.clone();
        self.start(&endpoint, security).await
    }

    /// Write one frame to the connection `id`
    pub async fn write_async(
        &self,
        id: ConnectionId,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let connection = self.connection(id).ok_or(IpcError::NotConnected)?;
        connection.write_async(payload, cancel).await
    }

    /// Encode and send one message to the connection `id`
    pub async fn send(&self, id: ConnectionId, message: &T, cancel: &CancellationToken) -> Result<()> {
        let connection = self.connection(id).ok_or(IpcError::NotConnected)?;
        connection.send(message, cancel).await
    }

    /// Write one frame to every active connection
    ///
    /// Writes run concurrently, so a peer that stops reading stalls only its
    /// own write. Connections that fail are skipped; only cancellation aborts
    /// the broadcast. Returns the number of connections written.
    pub async fn write_to_all_async(&self, payload: &[u8], cancel: &CancellationToken) -> Result<usize> {
        let targets = self.connections();
        let writes = targets
            .iter()
            .map(|connection| connection.write_async(payload, cancel));
        let results = join_all(writes).await;

        let mut delivered = 0;
        let mut cancelled = false;
        for (connection, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(IpcError::Cancelled) if cancel.is_cancelled() => cancelled = true,
                Err(e) if e.is_fatal_to_connection() => {
                    warn!(connection = %connection.id(), error = %e, "Connection dropped during broadcast");
                }
                Err(e) => {
                    debug!(connection = %connection.id(), error = %e, "Broadcast skipped connection");
                }
            }
        }

        if cancelled {
            debug!(delivered, "Broadcast cancelled");
            return Err(IpcError::Cancelled);
        }
        debug!(delivered, "Broadcast complete");
        Ok(delivered)
    }

    /// Encode `message` once and write it to every active connection
    pub async fn send_to_all(&self, message: &T, cancel: &CancellationToken) -> Result<usize> {
        let payload = self.inner.codec.encode(message).map_err(|e| {
            global_metrics().serialization_error();
            e
        })?;
        self.write_to_all_async(&payload, cancel).await
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Connection<T>> {
        self.inner
            .connections
            .lock()
            .ok()
            .and_then(|connections| connections.get(&id).cloned())
    }

    /// Snapshot of the active connections
    pub fn connections(&self) -> Vec<Connection<T>> {
        self.inner
            .connections
            .lock()
            .map(|connections| connections.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.inner
            .connections
            .lock()
            .map(|connections| connections.len())
            .unwrap_or(0)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.inner.endpoint.lock().ok().and_then(|slot| slot.clone())
    }

    /// Stop accepting and dispose every connection; idempotent
    pub fn dispose(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        for connection in self.connections() {
            connection.dispose();
        }
        info!("Server disposed");
    }

    /// Dispose, then wait for connections to close within the configured
    /// shutdown timeout
    pub async fn shutdown(&self) {
        self.dispose();

        let deadline = tokio::time::sleep(self.inner.config.shutdown_timeout);
        tokio::pin!(deadline);

        loop {
            let remaining = self.connection_count();
            if remaining == 0 {
                info!("All connections closed");
                return;
            }
            tokio::select! {
                _ = &mut deadline => {
                    warn!(remaining, "Shutdown timeout reached");
                    return;
                }
                _ = tokio::time::sleep(DRAIN_POLL_INTERVAL) => {
                    debug!(remaining, "Waiting for connections to close");
                }
            }
        }
    }
}

impl<T: Send + 'static> Drop for Server<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<T> ServerShared<T> {
    fn emit(&self, event: ServerEvent<T>) {
        if self.events.send(event).is_err() {
            debug!("Server event receiver dropped");
        }
    }
}

#[instrument(skip_all, fields(endpoint = %endpoint))]
async fn accept_loop<T>(
    shared: Arc<ServerShared<T>>,
    endpoint: Endpoint,
    mut listener: PipeListener,
    connection_events: EventSender<ConnectionEvent<T>>,
) where
    T: Send + 'static,
{
    loop {
        let accepted = tokio::select! {
            _ = shared.shutdown.cancelled() => {
                info!("Accept loop stopped");
                break;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok(Accepted { stream, identity }) => {
                let admitted = {
                    let Ok(mut connections) = shared.connections.lock() else {
                        error!("Connection set lock poisoned");
                        break;
                    };
                    if shared.shutdown.is_cancelled() {
                        break;
                    }
                    if connections.len() >= shared.config.max_connections {
                        None
                    } else {
                        let connection = Connection::from_parts(
                            stream,
                            endpoint.name(),
                            Arc::clone(&shared.codec),
                            shared.frame_codec,
                            identity,
                            connection_events.clone(),
                        );
                        connections.insert(connection.id(), connection.clone());
                        Some((connection, connections.len()))
                    }
                };

                let Some((connection, active)) = admitted else {
                    warn!(
                        max_connections = shared.config.max_connections,
                        "Connection limit reached, rejecting client"
                    );
                    continue;
                };

                info!(connection = %connection.id(), active, "Client connected");
                shared.emit(ServerEvent::ClientConnected(connection.clone()));

                if let Err(e) = connection.start() {
                    error!(connection = %connection.id(), error = %e, "Failed to start connection");
                    if let Ok(mut connections) = shared.connections.lock() {
                        connections.remove(&connection.id());
                    }
                }
            }
            Err(AcceptError::Connection(e)) => {
                global_metrics().accept_error();
                error!(error = %e, "Error accepting connection");
                shared.emit(ServerEvent::Exception {
                    connection: None,
                    error: e.into(),
                });
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
            Err(AcceptError::Listener(e)) => {
                global_metrics().accept_error();
                error!(error = %e, "Listener failed, no longer accepting");
                shared.emit(ServerEvent::Exception {
                    connection: None,
                    error: e.into(),
                });
                break;
            }
        }
    }

    shared.running.store(false, Ordering::Release);
}

async fn dispatch_loop<T>(
    shared: Arc<ServerShared<T>>,
    mut connection_events: mpsc::UnboundedReceiver<ConnectionEvent<T>>,
) where
    T: Send + 'static,
{
    while let Some(event) = connection_events.recv().await {
        match event {
            ConnectionEvent::MessageReceived {
                connection,
                message,
            } => shared.emit(ServerEvent::MessageReceived {
                connection,
                message,
            }),
            ConnectionEvent::Exception { connection, error } => {
                warn!(connection = %connection.id(), error = %error, "Connection failed");
                shared.emit(ServerEvent::Exception {
                    connection: Some(connection),
                    error,
                });
            }
            ConnectionEvent::Disconnected { connection } => {
                let active = match shared.connections.lock() {
                    Ok(mut connections) => {
                        connections.remove(&connection.id());
                        connections.len()
                    }
                    Err(_) => 0,
                };
                info!(connection = %connection.id(), active, "Client disconnected");
                shared.emit(ServerEvent::ClientDisconnected(connection));
            }
        }
    }
    debug!("Server dispatch loop finished");
}
