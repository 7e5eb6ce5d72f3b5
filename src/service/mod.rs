//! # Messaging Service
//!
//! Framed duplex connections and the server and client built on them.
//!
//! - [`Connection`]: one stream, a read loop and a single-writer write path
//! - [`Server`]: accepts connections on a named endpoint and tracks them
//! - [`Client`]: holds at most one connection to a server at a time

pub mod client;
pub mod connection;
pub mod events;
pub mod server;

pub use client::{Client, ClientState};
pub use connection::{Connection, ConnectionId, ConnectionState, FrameWriter};
pub use events::{ClientEvent, ConnectionEvent, EventSender, EventStream, ServerEvent};
pub use server::Server;
