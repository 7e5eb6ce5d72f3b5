//! # Serialization Formats
//!
//! Serde-backed [`MessageCodec`] adapters for application messages.
//! Supports bincode (default), JSON (debugging/interop), and MessagePack
//! (compact encoding).
//!
//! ## Performance Characteristics
//! - **Bincode**: fastest, binary
//! - **MessagePack**: compact, binary, self-describing
//! - **JSON**: human-readable, text
//!
//! ## Usage
//! ```rust
//! use pipe_messaging::core::codec::MessageCodec;
//! use pipe_messaging::core::serialization::{SerdeCodec, SerializationFormat};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct Note {
//!     id: u32,
//!     text: String,
//! }
//!
//! let codec = SerdeCodec::<Note>::new(SerializationFormat::Json);
//! let bytes = codec.encode(&Note { id: 1, text: "hi".into() }).unwrap();
//! let back = codec.decode(&bytes).unwrap();
//! assert_eq!(back.id, 1);
//! ```

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::codec::MessageCodec;
use crate::error::{IpcError, Result};

/// Supported serialization formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    /// Binary compact format (default, fastest)
    #[default]
    Bincode,
    /// Human-readable JSON format (debugging, interop)
    Json,
    /// Compact binary format (MessagePack, efficient)
    #[serde(rename = "msgpack")]
    MessagePack,
}

impl SerializationFormat {
    /// Get human-readable name
    pub fn name(self) -> &'static str {
        match self {
            SerializationFormat::Bincode => "Bincode",
            SerializationFormat::Json => "JSON",
            SerializationFormat::MessagePack => "MessagePack",
        }
    }

    /// Serialize a value with this format
    pub fn to_bytes<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            SerializationFormat::Bincode => bincode::serialize(value).map_err(IpcError::from),
            SerializationFormat::Json => {
                serde_json::to_vec(value).map_err(|e| IpcError::Serialization(e.to_string()))
            }
            SerializationFormat::MessagePack => {
                rmp_serde::to_vec(value).map_err(|e| IpcError::Serialization(e.to_string()))
            }
        }
    }

    /// Deserialize a value with this format
    pub fn from_bytes<T: DeserializeOwned>(self, data: &[u8]) -> Result<T> {
        match self {
            SerializationFormat::Bincode => bincode::deserialize(data).map_err(IpcError::from),
            SerializationFormat::Json => {
                serde_json::from_slice(data).map_err(|e| IpcError::Serialization(e.to_string()))
            }
            SerializationFormat::MessagePack => {
                rmp_serde::from_slice(data).map_err(|e| IpcError::Serialization(e.to_string()))
            }
        }
    }
}

impl fmt::Display for SerializationFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// [`MessageCodec`] for any serde type, using one [`SerializationFormat`]
pub struct SerdeCodec<T> {
    format: SerializationFormat,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SerdeCodec<T> {
    pub fn new(format: SerializationFormat) -> Self {
        Self {
            format,
            _marker: PhantomData,
        }
    }

    pub fn format(&self) -> SerializationFormat {
        self.format
    }
}

impl<T> Default for SerdeCodec<T> {
    fn default() -> Self {
        Self::new(SerializationFormat::default())
    }
}

impl<T> Clone for SerdeCodec<T> {
    fn clone(&self) -> Self {
        Self::new(self.format)
    }
}

impl<T> fmt::Debug for SerdeCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerdeCodec")
            .field("format", &self.format)
            .finish()
    }
}

impl<T> MessageCodec<T> for SerdeCodec<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn encode(&self, message: &T) -> Result<Vec<u8>> {
        self.format.to_bytes(message)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        self.format.from_bytes(bytes)
    }
}
