//! Event types delivered by connections, servers and clients.
//!
//! Events are pushed into unbounded channels and consumed as streams, so a
//! slow consumer never stalls a read loop.

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::connection::Connection;
use crate::error::IpcError;

/// Sending half of an event channel
pub type EventSender<E> = mpsc::UnboundedSender<E>;

/// Receiving half of an event channel, as a `Stream`
pub type EventStream<E> = UnboundedReceiverStream<E>;

/// Create an event channel
pub fn channel<E>() -> (EventSender<E>, EventStream<E>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, UnboundedReceiverStream::new(rx))
}

/// Events of a single connection
///
/// Per connection: any number of `MessageReceived`, then at most one
/// `Exception`, then exactly one `Disconnected`.
#[derive(Debug)]
pub enum ConnectionEvent<T> {
    MessageReceived { connection: Connection<T>, message: T },
    Exception { connection: Connection<T>, error: IpcError },
    Disconnected { connection: Connection<T> },
}

/// Events of a [`Server`](super::Server)
#[derive(Debug)]
pub enum ServerEvent<T> {
    /// A client was accepted; emitted before any of its messages
    ClientConnected(Connection<T>),
    /// A client connection closed and left the active set
    ClientDisconnected(Connection<T>),
    MessageReceived { connection: Connection<T>, message: T },
    /// `connection` is `None` for failures of the accept loop itself
    Exception {
        connection: Option<Connection<T>>,
        error: IpcError,
    },
}

/// Events of a [`Client`](super::Client)
#[derive(Debug)]
pub enum ClientEvent<T> {
    Connected(Connection<T>),
    Disconnected(Connection<T>),
    MessageReceived { connection: Connection<T>, message: T },
    /// `connection` is `None` when a connect attempt failed
    Exception {
        connection: Option<Connection<T>>,
        error: IpcError,
    },
}
