//! Sentinel framing
//!
//! Format: `[0,0,0,0] | JSON(RouteDescriptor) | [0,0,0,0] | payload`
//!
//! serde_json never emits a raw NUL byte, so the first zero run after the
//! leading sentinel always terminates the metadata and the payload may contain
//! anything.

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::trace;

use crate::discovery::HEARTBEAT;
use crate::route::RouteDescriptor;

/// Four zero bytes delimiting the metadata
pub const SENTINEL: [u8; 4] = [0; 4];

/// Upper bound on the metadata read by [`read_route_header`]
pub const MAX_HEADER_SIZE: usize = 16 * 1024;

/// Frame errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Frame header exceeds {0} bytes")]
    HeaderTooLarge(usize),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Stream ended before frame header was complete")]
    UnexpectedEof,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type FrameResult<T> = Result<T, FrameError>;

/// Encode a descriptor and payload into a single sentinel frame
pub fn encode_frame(route: &RouteDescriptor, payload: &[u8]) -> FrameResult<Bytes> {
    let metadata =
        serde_json::to_vec(route).map_err(|e| FrameError::Malformed(e.to_string()))?;

    let mut buf = BytesMut::with_capacity(SENTINEL.len() * 2 + metadata.len() + payload.len());
    buf.extend_from_slice(&SENTINEL);
    buf.extend_from_slice(&metadata);
    buf.extend_from_slice(&SENTINEL);
    buf.extend_from_slice(payload);

    Ok(buf.freeze())
}

/// Decode a sentinel frame into its descriptor and payload
pub fn decode_frame(frame: &[u8]) -> FrameResult<(RouteDescriptor, Bytes)> {
    if frame.len() < SENTINEL.len() * 2 {
        return Err(FrameError::Malformed(format!(
            "frame of {} bytes is shorter than two sentinels",
            frame.len()
        )));
    }

    let body = frame.strip_prefix(&SENTINEL[..]).unwrap_or(frame);

    let end = find_sentinel(body)
        .ok_or_else(|| FrameError::Malformed("no sentinel after metadata".to_string()))?;

    let route: RouteDescriptor = serde_json::from_slice(&body[..end])
        .map_err(|e| FrameError::Malformed(format!("invalid route descriptor: {}", e)))?;

    let payload = Bytes::copy_from_slice(&body[end + SENTINEL.len()..]);

    Ok((route, payload))
}

fn find_sentinel(buf: &[u8]) -> Option<usize> {
    buf.windows(SENTINEL.len()).position(|w| w == SENTINEL)
}

/// Read the route header from the start of a data stream
///
/// Consumes exactly the header; any payload that follows stays buffered in
/// `reader`. Heartbeat literals received before the header are skipped.
pub async fn read_route_header<R>(reader: &mut R) -> FrameResult<RouteDescriptor>
where
    R: AsyncBufRead + Unpin,
{
    let mut header: Vec<u8> = Vec::with_capacity(256);

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Err(FrameError::UnexpectedEof);
        }

        let mut consumed = 0;
        let mut complete = false;
        let mut garbage = false;

        for &byte in available {
            header.push(byte);
            consumed += 1;

            if header[0] != 0 {
                // Not a frame yet: only a heartbeat may appear here
                if !HEARTBEAT.as_bytes().starts_with(&header) {
                    garbage = true;
                    break;
                }
                if header.len() == HEARTBEAT.len() {
                    trace!("Heartbeat received ahead of route header");
                    header.clear();
                }
                continue;
            }

            if header.len() >= SENTINEL.len() * 2
                && header.starts_with(&SENTINEL)
                && header.ends_with(&SENTINEL)
            {
                complete = true;
                break;
            }
        }

        reader.consume(consumed);

        if garbage {
            return Err(FrameError::Malformed(
                "stream does not start with a sentinel".to_string(),
            ));
        }

        if complete {
            let (route, _) = decode_frame(&header)?;
            return Ok(route);
        }

        if header.len() > MAX_HEADER_SIZE {
            return Err(FrameError::HeaderTooLarge(MAX_HEADER_SIZE));
        }
    }
}
