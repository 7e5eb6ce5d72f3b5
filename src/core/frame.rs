//! # Frame Codec
//!
//! Length-prefixed framing of opaque payloads.
//!
//! ## Wire Format
//! ```text
//! [Length(4, little-endian)] [Payload(Length)]
//! ```
//!
//! A zero length is valid and carries an empty message. The stream has no
//! handshake and no magic bytes; every frame is exactly one codec-produced
//! payload.
//!
//! End-of-stream while reading a prefix or a payload body is a graceful
//! disconnect, never an error.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::config::MAX_PAYLOAD_SIZE;
use crate::error::{IpcError, Result};

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Encode a payload into a single wire frame
///
/// Payloads above [`MAX_PAYLOAD_SIZE`] are rejected, the same limit
/// [`decode_stream`] applies.
pub fn encode(payload: &[u8]) -> Result<Bytes> {
    encode_with_limit(payload, MAX_PAYLOAD_SIZE)
}

/// Same as [`encode`] with an explicit payload size limit
pub fn encode_with_limit(payload: &[u8], max_payload: usize) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len().min(max_payload));
    put_frame(payload, max_payload, &mut buf)?;
    Ok(buf.freeze())
}

/// Read exactly one frame from `reader`
///
/// Returns `Ok(None)` when the stream ends, whether at a frame boundary or
/// part way through a frame.
pub async fn decode_stream<R>(reader: &mut R) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    decode_stream_with_limit(reader, MAX_PAYLOAD_SIZE).await
}

/// Same as [`decode_stream`] with an explicit payload size limit
pub async fn decode_stream_with_limit<R>(reader: &mut R, max_payload: usize) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    if !read_full(reader, &mut prefix).await? {
        return Ok(None);
    }

    let len = u32::from_le_bytes(prefix) as usize;
    if len > max_payload {
        return Err(IpcError::OversizedFrame(len));
    }

    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload).await? {
        debug!(expected = len, "Stream ended inside a frame body");
        return Ok(None);
    }

    Ok(Some(Bytes::from(payload)))
}

/// Fill `buf` completely, looping over short reads. `false` on end-of-stream.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<bool>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn put_frame(payload: &[u8], max_payload: usize, dst: &mut BytesMut) -> Result<()> {
    if payload.len() > max_payload || payload.len() > u32::MAX as usize {
        return Err(IpcError::OversizedFrame(payload.len()));
    }
    dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
    dst.put_u32_le(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Tokio codec for the length-prefixed frame format
///
/// Used with `FramedRead` by the connection read loop; partial reads are
/// buffered until a whole frame is available.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PAYLOAD_SIZE)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = IpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        if src.len() < LENGTH_PREFIX_SIZE {
            src.reserve(LENGTH_PREFIX_SIZE - src.len());
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX_SIZE]);
        let len = u32::from_le_bytes(prefix) as usize;

        if len > self.max_payload {
            return Err(IpcError::OversizedFrame(len));
        }

        let total = LENGTH_PREFIX_SIZE + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(src.split_to(len).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !src.is_empty() {
                    debug!(remaining = src.len(), "Stream ended inside a frame");
                    src.clear();
                }
                Ok(None)
            }
        }
    }
}

impl<'a> Encoder<&'a [u8]> for FrameCodec {
    type Error = IpcError;

    fn encode(&mut self, payload: &'a [u8], dst: &mut BytesMut) -> Result<()> {
        put_frame(payload, self.max_payload, dst)
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = IpcError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<()> {
        put_frame(&payload, self.max_payload, dst)
    }
}
