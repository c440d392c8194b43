//! Length-prefixed framing for streams that carry discrete messages
//!
//! Chunked streams: `[meta_len: u32][meta: JSON][payload_len: u32][payload]`
//! Packet streams: `[len: u16][ip packet]`

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::codec::FrameError;
use crate::route::RouteDescriptor;

/// Largest payload accepted in a single chunk (1MB)
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Largest IP packet carried on a packet stream
pub const MAX_PACKET_FRAME: usize = u16::MAX as usize;

const MAX_METADATA_SIZE: usize = 16 * 1024;

/// One chunk on a chunked stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub route: RouteDescriptor,
    pub payload: Bytes,
}

impl ChunkFrame {
    pub fn new(route: RouteDescriptor, payload: impl Into<Bytes>) -> Self {
        Self {
            route,
            payload: payload.into(),
        }
    }
}

/// tokio-util codec for [`ChunkFrame`]
#[derive(Debug, Clone, Default)]
pub struct ChunkCodec {
    _priv: (),
}

impl ChunkCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Encoder<ChunkFrame> for ChunkCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: ChunkFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let metadata =
            serde_json::to_vec(&frame.route).map_err(|e| FrameError::Malformed(e.to_string()))?;

        if metadata.len() > MAX_METADATA_SIZE {
            return Err(FrameError::HeaderTooLarge(MAX_METADATA_SIZE));
        }
        if frame.payload.len() > MAX_CHUNK_SIZE {
            return Err(FrameError::FrameTooLarge(frame.payload.len()));
        }

        dst.reserve(8 + metadata.len() + frame.payload.len());
        dst.put_u32(metadata.len() as u32);
        dst.extend_from_slice(&metadata);
        dst.put_u32(frame.payload.len() as u32);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}

impl Decoder for ChunkCodec {
    type Item = ChunkFrame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let meta_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if meta_len > MAX_METADATA_SIZE {
            return Err(FrameError::HeaderTooLarge(MAX_METADATA_SIZE));
        }

        if src.len() < 4 + meta_len + 4 {
            src.reserve(4 + meta_len + 4 - src.len());
            return Ok(None);
        }

        let p = 4 + meta_len;
        let payload_len = u32::from_be_bytes([src[p], src[p + 1], src[p + 2], src[p + 3]]) as usize;
        if payload_len > MAX_CHUNK_SIZE {
            return Err(FrameError::FrameTooLarge(payload_len));
        }

        let total = 4 + meta_len + 4 + payload_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(4);
        let metadata = src.split_to(meta_len);
        src.advance(4);
        let payload = src.split_to(payload_len).freeze();

        let route: RouteDescriptor = serde_json::from_slice(&metadata)
            .map_err(|e| FrameError::Malformed(format!("invalid chunk metadata: {}", e)))?;

        Ok(Some(ChunkFrame { route, payload }))
    }
}

/// Codec for IP packets on a packet stream
pub fn packet_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(2)
        .max_frame_length(MAX_PACKET_FRAME)
        .new_codec()
}
