//! # Core Protocol Components
//!
//! Framing and message encoding, independent of any transport.
//!
//! ## Components
//! - **Frame**: length-prefixed wire frames and the tokio codec that reads them
//! - **Codec**: the `MessageCodec<T>` seam and the tagged codec registry
//! - **Serialization**: serde-backed codecs (bincode, JSON, MessagePack)
//!
//! ## Wire Format
//! ```text
//! [Length(4, little-endian)] [Payload(Length)]
//! ```
//!
//! ## Security
//! - Maximum payload size: 16MB by default (prevents memory exhaustion)
//! - Length validation before allocation

pub mod codec;
pub mod frame;
pub mod serialization;
