//! # Client
//!
//! Connects to a server endpoint and holds at most one connection at a time.
//!
//! ```text
//! Idle → Connecting → Connected → Disconnected → Connecting → ...
//! ```
//!
//! There is no automatic reconnection: after `Disconnected`, call
//! [`Client::connect_async`] again.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::Connection;
use super::events::{self, ClientEvent, ConnectionEvent, EventSender, EventStream};
use crate::config::{ClientConfig, IpcConfig};
use crate::core::codec::MessageCodec;
use crate::core::frame::FrameCodec;
use crate::error::constants::ERR_ALREADY_CONNECTED;
use crate::error::{IpcError, Result};
use crate::transport::{self, Endpoint};
use crate::utils::timeout::with_timeout_error;

/// Connection state of a [`Client`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

struct ClientShared<T> {
    codec: Arc<dyn MessageCodec<T>>,
    config: ClientConfig,
    frame_codec: FrameCodec,
    state: watch::Sender<ClientState>,
    current: Mutex<Option<Connection<T>>>,
    events: EventSender<ClientEvent<T>>,
}

/// Single-connection client
pub struct Client<T: Send + 'static> {
    inner: Arc<ClientShared<T>>,
}

impl<T: Send + 'static> fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("state", &*self.inner.state.borrow())
            .field("endpoint", &self.inner.config.endpoint)
            .finish_non_exhaustive()
    }
}

impl<T> Client<T>
where
    T: Send + 'static,
{
    /// Create a client and the stream of its events
    pub fn new<C>(codec: C, config: &IpcConfig) -> (Self, EventStream<ClientEvent<T>>)
    where
        C: MessageCodec<T>,
    {
        let (events, stream) = events::channel();
        let (state, _) = watch::channel(ClientState::Idle);
        let client = Self {
            inner: Arc::new(ClientShared {
                codec: Arc::new(codec),
                config: config.client.clone(),
                frame_codec: FrameCodec::with_max_payload(config.transport.max_payload_size),
                state,
                current: Mutex::new(None),
                events,
            }),
        };
        (client, stream)
    }

    /// Connect to `endpoint`, waiting up to `timeout` for it to accept
    ///
    /// On failure an `Exception` event is emitted and the error returned. On
    /// success `Connected` is emitted before any message of the connection.
    #[instrument(skip(self, endpoint, cancel), fields(endpoint = %endpoint))]
    pub async fn connect_async(
        &self,
        endpoint: &str,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<()> {
        let began = self.inner.state.send_if_modified(|state| match *state {
            ClientState::Idle | ClientState::Disconnected => {
                *state = ClientState::Connecting;
                true
            }
            ClientState::Connecting | ClientState::Connected => false,
        });
        if !began {
            return Err(IpcError::InvalidState(ERR_ALREADY_CONNECTED));
        }
        let attempt = ConnectAttempt::new(&self.inner.state);

        let stream = match self.open(endpoint, cancel, timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Connect failed");
                self.inner.state.send_replace(ClientState::Disconnected);
                self.inner.emit(ClientEvent::Exception {
                    connection: None,
                    error: e.clone(),
                });
                return Err(e);
            }
        };

        let (connection_events, connection_rx) = mpsc::unbounded_channel();
        let connection = Connection::from_parts(
            stream,
            endpoint,
            Arc::clone(&self.inner.codec),
            self.inner.frame_codec,
            None,
            connection_events,
        );

        if let Ok(mut current) = self.inner.current.lock() {
            *current = Some(connection.clone());
        }
        self.inner.state.send_replace(ClientState::Connected);
        attempt.complete();
        info!(connection = %connection.id(), "Connected to server");
        self.inner.emit(ClientEvent::Connected(connection.clone()));

        tokio::spawn(forward_events(Arc::clone(&self.inner), connection_rx));
        connection.start()
    }

    /// Connect using the endpoint and timeout from the configuration
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        let endpoint = self.inner.config.endpoint.clone();
        self.connect_async(&endpoint, cancel, self.inner.config.connect_timeout)
            .await
    }

    async fn open(
        &self,
        endpoint: &str,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<transport::BoxedStream> {
        let endpoint = Endpoint::new(endpoint)?;
        let poll_interval = self.inner.config.connect_poll_interval;
        let name = endpoint.name().to_string();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(IpcError::Cancelled),
            stream = with_timeout_error(
                transport::connect(&endpoint, poll_interval),
                timeout,
                || IpcError::ConnectTimeout { endpoint: name, timeout },
            ) => stream,
        }
    }

    /// Write one frame to the server
    pub async fn write_async(&self, payload: &[u8], cancel: &CancellationToken) -> Result<()> {
        let connection = self.connection().ok_or(IpcError::NotConnected)?;
        connection.write_async(payload, cancel).await
    }

    /// Encode and send one message to the server
    pub async fn send(&self, message: &T, cancel: &CancellationToken) -> Result<()> {
        let connection = self.connection().ok_or(IpcError::NotConnected)?;
        connection.send(message, cancel).await
    }

    /// Current connection, if any
    pub fn connection(&self) -> Option<Connection<T>> {
        self.inner.current.lock().ok().and_then(|current| current.clone())
    }

    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    /// Wait until the client leaves `Connected`
    pub async fn disconnected(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state
            .wait_for(|state| matches!(state, ClientState::Idle | ClientState::Disconnected))
            .await;
    }

    /// Close the current connection, if any; idempotent
    pub fn dispose(&self) {
        if let Some(connection) = self.connection() {
            debug!(connection = %connection.id(), "Disposing client connection");
            connection.dispose();
        }
    }
}

impl<T: Send + 'static> Drop for Client<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Resets `Connecting` to `Disconnected` if a connect attempt is dropped
/// before it completes
struct ConnectAttempt<'a> {
    state: &'a watch::Sender<ClientState>,
    done: bool,
}

impl<'a> ConnectAttempt<'a> {
    fn new(state: &'a watch::Sender<ClientState>) -> Self {
        Self { state, done: false }
    }

    fn complete(mut self) {
        self.done = true;
    }
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let reset = self.state.send_if_modified(|state| {
            if *state == ClientState::Connecting {
                *state = ClientState::Disconnected;
                true
            } else {
                false
            }
        });
        if reset {
            debug!("Connect attempt abandoned");
        }
    }
}

impl<T> ClientShared<T> {
    fn emit(&self, event: ClientEvent<T>) {
        if self.events.send(event).is_err() {
            debug!("Client event receiver dropped");
        }
    }
}

/// Relay one connection's events; ends after its `Disconnected`
async fn forward_events<T>(
    shared: Arc<ClientShared<T>>,
    mut connection_events: mpsc::UnboundedReceiver<ConnectionEvent<T>>,
) where
    T: Send + 'static,
{
    while let Some(event) = connection_events.recv().await {
        match event {
            ConnectionEvent::MessageReceived {
                connection,
                message,
            } => shared.emit(ClientEvent::MessageReceived {
                connection,
                message,
            }),
            ConnectionEvent::Exception { connection, error } => {
                warn!(connection = %connection.id(), error = %error, "Connection failed");
                shared.emit(ClientEvent::Exception {
                    connection: Some(connection),
                    error,
                });
            }
            ConnectionEvent::Disconnected { connection } => {
                if let Ok(mut current) = shared.current.lock() {
                    if current.as_ref().map(Connection::id) == Some(connection.id()) {
                        *current = None;
                    }
                }
                shared.state.send_replace(ClientState::Disconnected);
                info!(connection = %connection.id(), "Disconnected from server");
                shared.emit(ClientEvent::Disconnected(connection));
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::codec::RawCodec;
    use crate::service::server::Server;
    use bytes::Bytes;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_write_without_connection() {
        let (client, _events) = Client::<Bytes>::new(RawCodec, &IpcConfig::default());
        let token = CancellationToken::new();
        assert_eq!(client.state(), ClientState::Idle);
        assert!(matches!(
            client.write_async(b"x", &token).await,
            Err(IpcError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_timeout_emits_exception() {
        let (client, mut events) = Client::<Bytes>::new(RawCodec, &IpcConfig::default());
        let token = CancellationToken::new();
        let endpoint = format!("pipe-messaging-nobody-{}", std::process::id());

        let result = client
            .connect_async(&endpoint, &token, Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(IpcError::ConnectTimeout { .. })));
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(matches!(
            events.next().await,
            Some(ClientEvent::Exception {
                connection: None,
                error: IpcError::ConnectTimeout { .. }
            })
        ));
    }

    #[tokio::test]
    async fn test_dropped_connect_allows_retry() {
        let config = IpcConfig::default();
        let (client, _events) = Client::<Bytes>::new(RawCodec, &config);
        let token = CancellationToken::new();
        let endpoint = format!("pipe-messaging-dropped-{}", std::process::id());

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            client.connect_async(&endpoint, &token, Duration::from_secs(5)),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(client.state(), ClientState::Disconnected);

        let (server, _server_events) = Server::<Bytes>::new(RawCodec, &config);
        server.start(&endpoint, None).await.unwrap();

        client
            .connect_async(&endpoint, &token, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(client.state(), ClientState::Connected);

        server.dispose();
    }

    #[tokio::test]
    async fn test_connect_cancelled() {
        let (client, _events) = Client::<Bytes>::new(RawCodec, &IpcConfig::default());
        let token = CancellationToken::new();
        token.cancel();
        let endpoint = format!("pipe-messaging-cancel-{}", std::process::id());

        let result = client
            .connect_async(&endpoint, &token, Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(IpcError::Cancelled)));
        assert_eq!(client.state(), ClientState::Disconnected);
    }
}
