//! # Message Codecs
//!
//! The seam between typed application messages and frame payloads.
//!
//! A connection only ever calls [`MessageCodec::encode`] before writing a
//! frame and [`MessageCodec::decode`] after reading one. Anything that can
//! turn a `T` into bytes and back can be plugged in.
//!
//! ## Provided Codecs
//! - [`RawCodec`]: payload bytes are the message
//! - [`SerdeCodec`](crate::core::serialization::SerdeCodec): any serde type
//! - [`CodecRegistry`]: explicit per-tag encode/decode table with an
//!   optional fallback codec for unregistered tags
//!
//! ## Registry Wire Body
//! ```text
//! [Tag(2, little-endian)] [Body(N)]
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{IpcError, Result};

/// Converts messages of type `T` to and from frame payloads
pub trait MessageCodec<T>: Send + Sync + 'static {
    /// Encode a message into a payload
    fn encode(&self, message: &T) -> Result<Vec<u8>>;

    /// Decode a payload back into a message
    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

impl<T, C> MessageCodec<T> for Arc<C>
where
    C: MessageCodec<T> + ?Sized,
{
    fn encode(&self, message: &T) -> Result<Vec<u8>> {
        (**self).encode(message)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        (**self).decode(bytes)
    }
}

/// Identity codec: the payload is the message
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl MessageCodec<Bytes> for RawCodec {
    fn encode(&self, message: &Bytes) -> Result<Vec<u8>> {
        Ok(message.to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}

/// Messages that name their own variant with a stable numeric tag
pub trait TaggedMessage {
    fn tag(&self) -> u16;
}

type EncodeFn<T> = Box<dyn Fn(&T) -> Result<Vec<u8>> + Send + Sync>;
type DecodeFn<T> = Box<dyn Fn(&[u8]) -> Result<T> + Send + Sync>;

struct RegistryEntry<T> {
    encode: EncodeFn<T>,
    decode: DecodeFn<T>,
}

/// Explicit tag → encode/decode function table
///
/// Registered tags use their own functions. Unregistered tags go to the
/// fallback codec when one is configured and fail otherwise.
pub struct CodecRegistry<T> {
    entries: HashMap<u16, RegistryEntry<T>>,
    fallback: Option<Box<dyn MessageCodec<T>>>,
}

impl<T> CodecRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            fallback: None,
        }
    }

    /// Register the encode/decode pair for one tag
    ///
    /// Fails if the tag is already taken.
    pub fn register<E, D>(&mut self, tag: u16, encode: E, decode: D) -> Result<()>
    where
        E: Fn(&T) -> Result<Vec<u8>> + Send + Sync + 'static,
        D: Fn(&[u8]) -> Result<T> + Send + Sync + 'static,
    {
        if self.entries.contains_key(&tag) {
            return Err(IpcError::ConfigError(format!(
                "Codec already registered for tag {tag}"
            )));
        }
        self.entries.insert(
            tag,
            RegistryEntry {
                encode: Box::new(encode),
                decode: Box::new(decode),
            },
        );
        Ok(())
    }

    /// Use `codec` for every tag without a registered entry
    pub fn with_fallback<C>(mut self, codec: C) -> Self
    where
        C: MessageCodec<T>,
    {
        self.fallback = Some(Box::new(codec));
        self
    }

    pub fn is_registered(&self, tag: u16) -> bool {
        self.entries.contains_key(&tag)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for CodecRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for CodecRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.entries.keys().copied().collect();
        tags.sort_unstable();
        f.debug_struct("CodecRegistry")
            .field("tags", &tags)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl<T> MessageCodec<T> for CodecRegistry<T>
where
    T: TaggedMessage + 'static,
{
    fn encode(&self, message: &T) -> Result<Vec<u8>> {
        let tag = message.tag();
        let body = match (self.entries.get(&tag), &self.fallback) {
            (Some(entry), _) => (entry.encode)(message)?,
            (None, Some(fallback)) => fallback.encode(message)?,
            (None, None) => {
                return Err(IpcError::Serialization(format!(
                    "No codec registered for tag {tag}"
                )))
            }
        };

        let mut out = Vec::with_capacity(2 + body.len());
        out.extend_from_slice(&tag.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        if bytes.len() < 2 {
            return Err(IpcError::Serialization(format!(
                "Payload too short for a tag: {} bytes",
                bytes.len()
            )));
        }

        let tag = u16::from_le_bytes([bytes[0], bytes[1]]);
        let body = &bytes[2..];
        let message = match (self.entries.get(&tag), &self.fallback) {
            (Some(entry), _) => (entry.decode)(body)?,
            (None, Some(fallback)) => fallback.decode(body)?,
            (None, None) => {
                return Err(IpcError::Serialization(format!(
                    "No codec registered for tag {tag}"
                )))
            }
        };

        if message.tag() != tag {
            return Err(IpcError::Serialization(format!(
                "Decoded message tag {} does not match wire tag {tag}",
                message.tag()
            )));
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::serialization::{SerdeCodec, SerializationFormat};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum Command {
        Ping,
        Resize { width: u16, height: u16 },
        Note(String),
    }

    impl TaggedMessage for Command {
        fn tag(&self) -> u16 {
            match self {
                Command::Ping => 1,
                Command::Resize { .. } => 2,
                Command::Note(_) => 3,
            }
        }
    }

    fn registry() -> CodecRegistry<Command> {
        let mut registry = CodecRegistry::new();
        registry
            .register(1, |_| Ok(Vec::new()), |_| Ok(Command::Ping))
            .unwrap();
        registry
            .register(
                2,
                |cmd| match cmd {
                    Command::Resize { width, height } => {
                        let mut out = width.to_le_bytes().to_vec();
                        out.extend_from_slice(&height.to_le_bytes());
                        Ok(out)
                    }
                    _ => Err(IpcError::Serialization("not a resize".into())),
                },
                |body| {
                    if body.len() != 4 {
                        return Err(IpcError::Serialization("bad resize body".into()));
                    }
                    Ok(Command::Resize {
                        width: u16::from_le_bytes([body[0], body[1]]),
                        height: u16::from_le_bytes([body[2], body[3]]),
                    })
                },
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_registered_tags_use_their_functions() {
        let codec = registry();
        let bytes = codec
            .encode(&Command::Resize {
                width: 80,
                height: 24,
            })
            .unwrap();
        assert_eq!(bytes, vec![2, 0, 80, 0, 24, 0]);
        assert_eq!(
            codec.decode(&bytes).unwrap(),
            Command::Resize {
                width: 80,
                height: 24
            }
        );

        let ping = codec.encode(&Command::Ping).unwrap();
        assert_eq!(ping, vec![1, 0]);
        assert_eq!(codec.decode(&ping).unwrap(), Command::Ping);
    }

    #[test]
    fn test_unregistered_tag_without_fallback_fails() {
        let codec = registry();
        let result = codec.encode(&Command::Note("x".into()));
        assert!(matches!(result, Err(IpcError::Serialization(_))));
        assert!(matches!(codec.decode(&[3, 0]), Err(IpcError::Serialization(_))));
    }

    #[test]
    fn test_unregistered_tag_uses_fallback() {
        let codec = registry().with_fallback(SerdeCodec::<Command>::new(SerializationFormat::Json));
        let note = Command::Note("fallback".into());
        let bytes = codec.encode(&note).unwrap();
        assert_eq!(&bytes[..2], &[3, 0]);
        assert_eq!(codec.decode(&bytes).unwrap(), note);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut codec = registry();
        let result = codec.register(1, |_| Ok(Vec::new()), |_| Ok(Command::Ping));
        assert!(matches!(result, Err(IpcError::ConfigError(_))));
        assert_eq!(codec.len(), 2);
    }

    #[test]
    fn test_short_payload_rejected() {
        let codec = registry();
        assert!(matches!(codec.decode(&[1]), Err(IpcError::Serialization(_))));
    }

    #[test]
    fn test_raw_codec_is_identity() {
        let codec = RawCodec;
        let payload = Bytes::from_static(b"\x00\x01raw");
        let encoded = codec.encode(&payload).unwrap();
        assert_eq!(codec.decode(&encoded).unwrap(), payload);
    }
}
