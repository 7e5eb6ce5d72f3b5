//! # Pipe Messaging
//!
//! Duplex, length-prefixed messaging between local processes over named
//! pipes (Windows) and Unix domain sockets (Unix).
//!
//! ## Layers
//! - [`transport`]: platform streams behind a named [`Endpoint`](transport::Endpoint)
//! - [`core`]: the `[u32 LE length][payload]` frame codec and message codecs
//! - [`service`]: [`Connection`], [`Server`] and [`Client`]
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging, metrics
//!
//! ## Guarantees
//! - At most one frame is written to a stream at any instant
//! - A task writing again while it holds a connection's write lock gets
//!   [`IpcError::Reentrancy`] instead of a deadlock
//! - Each connection emits exactly one `Disconnected` event, after all of its
//!   messages and at most one `Exception`
//!
//! ## Example
//! ```rust,no_run
//! use bytes::Bytes;
//! use futures::StreamExt;
//! use pipe_messaging::core::codec::RawCodec;
//! use pipe_messaging::{IpcConfig, Server, ServerEvent};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> pipe_messaging::Result<()> {
//!     let (server, mut events) = Server::<Bytes>::new(RawCodec, &IpcConfig::default());
//!     server.start("my-app", None).await?;
//!
//!     let token = CancellationToken::new();
//!     while let Some(event) = events.next().await {
//!         if let ServerEvent::MessageReceived { connection, message } = event {
//!             connection.write_async(&message, &token).await?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::IpcConfig;
pub use error::{IpcError, Result};
pub use service::{
    Client, ClientEvent, ClientState, Connection, ConnectionEvent, ConnectionId, ConnectionState,
    EventStream, FrameWriter, Server, ServerEvent,
};
pub use transport::{Endpoint, PipeSecurity};
