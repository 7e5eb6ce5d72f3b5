//! # Connection
//!
//! One open duplex stream with a read loop and a single-writer write path.
//!
//! ## Discipline
//! - Exactly one read-loop task per started connection
//! - At most one frame being written at any instant (depth-1 async lock)
//! - A task that already holds the write lock and writes again through the
//!   connection fails fast with [`IpcError::Reentrancy`] and the connection is
//!   torn down, instead of deadlocking
//!
//! ## Lifecycle
//! ```text
//! Created → Connecting → Connected → Disconnecting → Disconnected
//! ```
//! `Disconnected` is terminal. Every event of a connection is emitted by its
//! read-loop task, so `MessageReceived` events always precede the single
//! `Exception` (when an error caused the disconnect) and the single
//! `Disconnected`.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use once_cell::sync::OnceCell;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::codec::{Encoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::{ConnectionEvent, EventSender};
use crate::core::codec::MessageCodec;
use crate::core::frame::{FrameCodec, LENGTH_PREFIX_SIZE};
use crate::error::constants::{
    ERR_ALREADY_STARTED, ERR_LOCK_POISONED, ERR_REENTRANT_WRITE, ERR_WRITE_MID_FRAME,
};
use crate::error::{IpcError, Result};
use crate::transport::IdentityResolver;
use crate::utils::metrics::global_metrics;

/// Time allowed for flushing and closing the write half on teardown
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type WriterSlot = Option<BoxedWriter>;

tokio::task_local! {
    /// Connections whose write lock is held by the current task
    static WRITE_SCOPE: Vec<ConnectionId>;
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

struct Shared<T> {
    id: ConnectionId,
    endpoint: String,
    state: watch::Sender<ConnectionState>,
    codec: Arc<dyn MessageCodec<T>>,
    frame_codec: FrameCodec,
    reader: Mutex<Option<BoxedReader>>,
    writer: Arc<AsyncMutex<WriterSlot>>,
    shutdown: CancellationToken,
    pending_error: Mutex<Option<IpcError>>,
    identity: OnceCell<Option<String>>,
    identity_source: Mutex<Option<IdentityResolver>>,
    events: EventSender<ConnectionEvent<T>>,
}

/// Handle to one framed duplex connection
///
/// Cloning is cheap; all clones refer to the same connection.
pub struct Connection<T> {
    inner: Arc<Shared<T>>,
}

impl<T> Clone for Connection<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl<T> Connection<T>
where
    T: Send + 'static,
{
    /// Wrap a stream; events are delivered to `events`
    ///
    /// The connection does nothing until [`start`](Self::start) is called.
    pub fn new<S, C>(stream: S, codec: C, events: EventSender<ConnectionEvent<T>>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        C: MessageCodec<T>,
    {
        Self::from_parts(
            stream,
            "",
            Arc::new(codec),
            FrameCodec::new(),
            None,
            events,
        )
    }

    pub(crate) fn from_parts<S>(
        stream: S,
        endpoint: &str,
        codec: Arc<dyn MessageCodec<T>>,
        frame_codec: FrameCodec,
        identity_source: Option<IdentityResolver>,
        events: EventSender<ConnectionEvent<T>>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let reader: BoxedReader = Box::new(reader);
        let writer: BoxedWriter = Box::new(writer);
        let (state, _) = watch::channel(ConnectionState::Created);

        Self {
            inner: Arc::new(Shared {
                id: ConnectionId::next(),
                endpoint: endpoint.to_string(),
                state,
                codec,
                frame_codec,
                reader: Mutex::new(Some(reader)),
                writer: Arc::new(AsyncMutex::new(Some(writer))),
                shutdown: CancellationToken::new(),
                pending_error: Mutex::new(None),
                identity: OnceCell::new(),
                identity_source: Mutex::new(identity_source),
                events,
            }),
        }
    }

    /// Limit on payload size for frames read and written by this connection
    pub fn with_max_payload(self, max_payload: usize) -> Result<Self> {
        let mut inner = Arc::try_unwrap(self.inner)
            .map_err(|_| IpcError::InvalidState("connection is already shared"))?;
        inner.frame_codec = FrameCodec::with_max_payload(max_payload);
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Caller identity of a server-side connection, resolved on first call
    pub fn identity(&self) -> Option<&str> {
        self.inner
            .identity
            .get_or_init(|| {
                let resolver = self
                    .inner
                    .identity_source
                    .lock()
                    .ok()
                    .and_then(|mut source| source.take());
                resolver.and_then(|resolve| resolve())
            })
            .as_deref()
    }

    /// Spawn the read loop
    ///
    /// May only be called once. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let began = self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Created {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !began {
            return Err(match self.state() {
                ConnectionState::Disconnecting | ConnectionState::Disconnected => {
                    IpcError::ConnectionClosed
                }
                _ => IpcError::InvalidState(ERR_ALREADY_STARTED),
            });
        }

        let reader = self
            .inner
            .reader
            .lock()
            .map_err(|_| IpcError::InvalidState(ERR_LOCK_POISONED))?
            .take()
            .ok_or(IpcError::InvalidState(ERR_ALREADY_STARTED))?;

        self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Connected;
                true
            } else {
                false
            }
        });

        global_metrics().connection_established();
        debug!(connection = %self.inner.id, endpoint = %self.inner.endpoint, "Connection started");
        tokio::spawn(read_loop(self.clone(), reader));
        Ok(())
    }

    /// Write one frame carrying `payload`
    ///
    /// Cancellation before any byte of the frame is written leaves the
    /// connection usable; cancellation part way through a frame disconnects.
    pub async fn write_async(&self, payload: &[u8], cancel: &CancellationToken) -> Result<()> {
        self.check_reentrancy()?;
        self.ensure_writable()?;

        let frame = self.encode_frame(payload)?;
        let mut guard = self.acquire_writer(cancel).await?;
        self.write_frame(&mut guard, &frame, cancel).await
    }

    /// Encode `message` with the connection codec and write it as one frame
    ///
    /// An encoding failure disconnects the connection.
    pub async fn send(&self, message: &T, cancel: &CancellationToken) -> Result<()> {
        let payload = self.encode_message(message)?;
        self.write_async(&payload, cancel).await
    }

    /// Hold the write lock for the duration of `f`
    ///
    /// Frames written through the [`FrameWriter`] go out back-to-back with no
    /// other writer in between. Writing through the connection itself from
    /// inside `f` is a re-entrant write: it fails with
    /// [`IpcError::Reentrancy`] and disconnects.
    ///
    /// Teardown closes the stream under the same lock, so while `f` holds the
    /// [`FrameWriter`] a disconnect is not reported until `f` returns. Keep
    /// unrelated awaits out of `f`.
    pub async fn with_writer<F, Fut, R>(&self, cancel: &CancellationToken, f: F) -> Result<R>
    where
        F: FnOnce(FrameWriter<T>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.check_reentrancy()?;
        self.ensure_writable()?;

        let guard = self.acquire_writer(cancel).await?;
        let writer = FrameWriter {
            connection: self.clone(),
            guard,
        };

        let mut scope = WRITE_SCOPE.try_with(|ids| ids.clone()).unwrap_or_default();
        scope.push(self.inner.id);
        WRITE_SCOPE.scope(scope, f(writer)).await
    }

    /// Tear the connection down; idempotent
    pub fn dispose(&self) {
        if self.begin_disconnect(None) {
            info!(connection = %self.inner.id, "Connection disposed");
        }
    }

    /// Wait until the connection reaches `Disconnected`
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state
            .wait_for(|state| *state == ConnectionState::Disconnected)
            .await;
    }

    fn check_reentrancy(&self) -> Result<()> {
        let reentrant = WRITE_SCOPE
            .try_with(|ids| ids.contains(&self.inner.id))
            .unwrap_or(false);
        if reentrant {
            global_metrics().reentrancy_violation();
            error!(connection = %self.inner.id, "{}", ERR_REENTRANT_WRITE);
            self.begin_disconnect(Some(IpcError::Reentrancy));
            return Err(IpcError::Reentrancy);
        }
        Ok(())
    }

    /// Writes are accepted from creation until teardown begins
    fn ensure_writable(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Disconnecting | ConnectionState::Disconnected => {
                Err(IpcError::ConnectionClosed)
            }
            _ => Ok(()),
        }
    }

    fn encode_message(&self, message: &T) -> Result<Vec<u8>> {
        self.inner.codec.encode(message).map_err(|e| {
            global_metrics().serialization_error();
            warn!(connection = %self.inner.id, error = %e, "Failed to encode message");
            self.begin_disconnect(Some(e.clone()));
            e
        })
    }

    fn encode_frame(&self, payload: &[u8]) -> Result<BytesMut> {
        let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
        let mut codec = self.inner.frame_codec;
        codec.encode(payload, &mut frame)?;
        Ok(frame)
    }

    async fn acquire_writer(&self, cancel: &CancellationToken) -> Result<OwnedMutexGuard<WriterSlot>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(IpcError::Cancelled),
            _ = self.inner.shutdown.cancelled() => Err(IpcError::ConnectionClosed),
            guard = Arc::clone(&self.inner.writer).lock_owned() => Ok(guard),
        }
    }

    async fn write_frame(
        &self,
        slot: &mut WriterSlot,
        frame: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let writer = slot.as_mut().ok_or(IpcError::ConnectionClosed)?;
        let mut written = 0;

        while written < frame.len() {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.abort_write(written, frame.len())),
                _ = self.inner.shutdown.cancelled() => return Err(IpcError::ConnectionClosed),
                result = writer.write(&frame[written..]) => result,
            };

            match result {
                Ok(0) => {
                    let err = IpcError::from(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "stream accepted no bytes",
                    ));
                    return Err(self.fail_write(err));
                }
                Ok(n) => written += n,
                Err(e) => return Err(self.fail_write(e.into())),
            }
        }

        let flushed = tokio::select! {
            _ = self.inner.shutdown.cancelled() => return Err(IpcError::ConnectionClosed),
            result = writer.flush() => result,
        };
        if let Err(e) = flushed {
            return Err(self.fail_write(e.into()));
        }

        global_metrics().message_sent(frame.len() as u64);
        debug!(connection = %self.inner.id, bytes = frame.len(), "Frame written");
        Ok(())
    }

    fn abort_write(&self, written: usize, total: usize) -> IpcError {
        if written > 0 {
            warn!(
                connection = %self.inner.id,
                written,
                total,
                "{}", ERR_WRITE_MID_FRAME
            );
            self.begin_disconnect(None);
        }
        IpcError::Cancelled
    }

    fn fail_write(&self, err: IpcError) -> IpcError {
        global_metrics().connection_error();
        warn!(connection = %self.inner.id, error = %err, "Write failed");
        self.begin_disconnect(Some(err.clone()));
        err
    }

    /// Move to `Disconnecting` and stop the read loop
    ///
    /// The first error recorded before teardown completes becomes the
    /// connection's single `Exception`. Returns whether this call initiated
    /// the teardown.
    fn begin_disconnect(&self, error: Option<IpcError>) -> bool {
        if let Some(error) = error {
            self.record_error(error);
        }

        let mut previous = ConnectionState::Disconnected;
        let initiated = self.inner.state.send_if_modified(|state| match *state {
            ConnectionState::Created | ConnectionState::Connecting | ConnectionState::Connected => {
                previous = *state;
                *state = ConnectionState::Disconnecting;
                true
            }
            ConnectionState::Disconnecting | ConnectionState::Disconnected => false,
        });

        if initiated {
            self.inner.shutdown.cancel();
            if previous == ConnectionState::Created {
                self.finish_unstarted();
            }
        }
        initiated
    }

    fn record_error(&self, error: IpcError) {
        if self.state() == ConnectionState::Disconnected {
            debug!(connection = %self.inner.id, error = %error, "Error after disconnect ignored");
            return;
        }
        if let Ok(mut pending) = self.inner.pending_error.lock() {
            if pending.is_none() {
                *pending = Some(error);
            } else {
                debug!(connection = %self.inner.id, error = %error, "Secondary error during teardown");
            }
        }
    }

    fn take_pending_error(&self) -> Option<IpcError> {
        self.inner
            .pending_error
            .lock()
            .ok()
            .and_then(|mut pending| pending.take())
    }

    /// Teardown for a connection whose read loop never ran
    fn finish_unstarted(&self) {
        if let Ok(mut reader) = self.inner.reader.lock() {
            reader.take();
        }
        if let Ok(mut writer) = self.inner.writer.try_lock() {
            writer.take();
        }
        self.complete_disconnect();
    }

    /// Teardown run by the read-loop task once it has stopped reading
    async fn finish(&self) {
        let writer = self.inner.writer.lock().await.take();
        if let Some(mut writer) = writer {
            match tokio::time::timeout(CLOSE_TIMEOUT, writer.shutdown()).await {
                Ok(Err(e)) => debug!(connection = %self.inner.id, error = %e, "Error closing stream"),
                Err(_) => debug!(connection = %self.inner.id, "Timed out closing stream"),
                Ok(Ok(())) => {}
            }
        }
        global_metrics().connection_closed();
        self.complete_disconnect();
    }

    fn complete_disconnect(&self) {
        let error = self.take_pending_error();
        self.inner.state.send_replace(ConnectionState::Disconnected);

        if let Some(error) = error {
            self.emit(ConnectionEvent::Exception {
                connection: self.clone(),
                error,
            });
        }
        info!(connection = %self.inner.id, endpoint = %self.inner.endpoint, "Connection closed");
        self.emit(ConnectionEvent::Disconnected {
            connection: self.clone(),
        });
    }

    fn emit(&self, event: ConnectionEvent<T>) {
        if self.inner.events.send(event).is_err() {
            debug!(connection = %self.inner.id, "Event receiver dropped");
        }
    }
}

async fn read_loop<T>(connection: Connection<T>, reader: BoxedReader)
where
    T: Send + 'static,
{
    let shared = Arc::clone(&connection.inner);
    let mut frames = FramedRead::new(reader, shared.frame_codec);

    let failure = loop {
        let next = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break None,
            next = frames.next() => next,
        };

        match next {
            Some(Ok(payload)) => {
                global_metrics().message_received((LENGTH_PREFIX_SIZE + payload.len()) as u64);
                match shared.codec.decode(&payload) {
                    Ok(message) => {
                        debug!(connection = %shared.id, bytes = payload.len(), "Message received");
                        connection.emit(ConnectionEvent::MessageReceived {
                            connection: connection.clone(),
                            message,
                        });
                    }
                    Err(e) => {
                        global_metrics().serialization_error();
                        error!(connection = %shared.id, error = %e, "Failed to decode message");
                        break Some(e);
                    }
                }
            }
            Some(Err(e)) => {
                match &e {
                    IpcError::Io(_) => global_metrics().connection_error(),
                    _ => global_metrics().serialization_error(),
                }
                warn!(connection = %shared.id, error = %e, "Read failed");
                break Some(e);
            }
            None => {
                debug!(connection = %shared.id, "Peer closed the stream");
                break None;
            }
        }
    };

    connection.begin_disconnect(failure);
    drop(frames);
    connection.finish().await;
}

/// Exclusive access to a connection's write half
///
/// Obtained through [`Connection::with_writer`].
pub struct FrameWriter<T> {
    connection: Connection<T>,
    guard: OwnedMutexGuard<WriterSlot>,
}

impl<T> FrameWriter<T>
where
    T: Send + 'static,
{
    /// Write one frame while keeping the lock
    pub async fn write(&mut self, payload: &[u8], cancel: &CancellationToken) -> Result<()> {
        self.connection.ensure_writable()?;
        let frame = self.connection.encode_frame(payload)?;
        self.connection
            .write_frame(&mut self.guard, &frame, cancel)
            .await
    }

    /// Encode and write one message while keeping the lock
    pub async fn send(&mut self, message: &T, cancel: &CancellationToken) -> Result<()> {
        let payload = self.connection.encode_message(message)?;
        self.write(&payload, cancel).await
    }

    pub fn connection(&self) -> &Connection<T> {
        &self.connection
    }
}

impl<T> fmt::Debug for FrameWriter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameWriter")
            .field("connection", &self.connection.inner.id)
            .finish()
    }
}
