//! Property-based tests using proptest
//!
//! These tests validate framing invariants across a wide range of randomly
//! generated payloads and read patterns.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use pipe_messaging::core::frame::{self, FrameCodec, LENGTH_PREFIX_SIZE};
use pipe_messaging::IpcError;
use proptest::prelude::*;
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::codec::Decoder;

/// Reader that hands out its data in fixed-size pieces
struct ChunkedReader {
    data: Vec<u8>,
    pos: usize,
    chunk: usize,
}

impl AsyncRead for ChunkedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let remaining = self.data.len() - self.pos;
        let n = remaining.min(self.chunk).min(buf.remaining());
        let start = self.pos;
        buf.put_slice(&self.data[start..start + n]);
        self.pos += n;
        Poll::Ready(Ok(()))
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime")
}

// Property: a frame is always prefix + payload, prefix holding the length
proptest! {
    #[test]
    fn prop_frame_layout(payload in prop::collection::vec(any::<u8>(), 0..10000)) {
        let encoded = frame::encode(&payload).expect("encode");

        prop_assert_eq!(encoded.len(), LENGTH_PREFIX_SIZE + payload.len());
        let prefix = u32::from_le_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        prop_assert_eq!(prefix as usize, payload.len());
        prop_assert_eq!(&encoded[LENGTH_PREFIX_SIZE..], &payload[..]);
    }
}

// Property: any sequence of frames survives any read chunking
proptest! {
    #[test]
    fn prop_decode_stream_any_chunking(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..512), 0..16),
        chunk in 1usize..64,
    ) {
        let mut data = Vec::new();
        for payload in &payloads {
            data.extend_from_slice(&frame::encode(payload).expect("encode"));
        }

        let decoded = runtime().block_on(async {
            let mut reader = ChunkedReader { data, pos: 0, chunk };
            let mut out = Vec::new();
            while let Some(frame) = frame::decode_stream(&mut reader).await.expect("decode") {
                out.push(frame.to_vec());
            }
            out
        });

        prop_assert_eq!(decoded, payloads);
    }
}

// Property: the codec yields the same frames however bytes are split across reads
proptest! {
    #[test]
    fn prop_codec_incremental_feed(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..256), 1..8),
        chunk in 1usize..32,
    ) {
        let mut data = Vec::new();
        for payload in &payloads {
            data.extend_from_slice(&frame::encode(payload).expect("encode"));
        }

        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for piece in data.chunks(chunk) {
            buf.extend_from_slice(piece);
            while let Some(frame) = codec.decode(&mut buf).expect("decode") {
                out.push(frame.to_vec());
            }
        }

        prop_assert_eq!(out, payloads);
        prop_assert!(buf.is_empty());
    }
}

// Property: a stream cut inside a frame ends cleanly after the whole frames
proptest! {
    #[test]
    fn prop_truncated_stream_is_end_of_stream(
        payload in prop::collection::vec(any::<u8>(), 1..512),
        cut in 1usize..512,
    ) {
        let mut data = frame::encode(b"whole").expect("encode").to_vec();
        let partial = frame::encode(&payload).expect("encode");
        let cut = cut.min(partial.len() - 1);
        data.extend_from_slice(&partial[..cut]);

        let decoded = runtime().block_on(async {
            let mut reader = ChunkedReader { data, pos: 0, chunk: 7 };
            let first = frame::decode_stream(&mut reader).await.expect("first");
            let second = frame::decode_stream(&mut reader).await.expect("second");
            (first, second)
        });

        prop_assert_eq!(decoded.0.as_deref(), Some(&b"whole"[..]));
        prop_assert!(decoded.1.is_none());
    }
}

// Property: lengths above the limit are rejected before the body is read
proptest! {
    #[test]
    fn prop_oversized_prefix_rejected(limit in 0usize..1024, excess in 1usize..1024) {
        let len = (limit + excess) as u32;
        let mut data = len.to_le_bytes().to_vec();
        data.extend_from_slice(&[0u8; 8]);

        let result = runtime().block_on(async {
            let mut reader = &data[..];
            frame::decode_stream_with_limit(&mut reader, limit).await
        });

        prop_assert!(matches!(result, Err(IpcError::OversizedFrame(n)) if n == len as usize));
    }
}
