//! The control stream: discovery on open, heartbeats afterwards

use futures::StreamExt;
use qtun_proto::{
    encode_discovery_response, parse_control_line, parse_discovery_response, ControlMessage,
    UpstreamEndpoint, DISCOVERY_REQUEST,
};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{SessionError, SessionResult};

/// Longest control line either side buffers before giving up on the stream
pub const MAX_CONTROL_LINE: usize = 64 * 1024;

/// Line reader over the receive half of a control stream
pub type ControlReader<R> = FramedRead<R, LinesCodec>;

pub fn control_reader<R: AsyncRead>(read: R) -> ControlReader<R> {
    FramedRead::new(read, LinesCodec::new_with_max_length(MAX_CONTROL_LINE))
}

/// Next line from the control stream, `None` once the peer finishes it
pub async fn next_control_line<R>(reader: &mut ControlReader<R>) -> SessionResult<Option<String>>
where
    R: AsyncRead + Unpin,
{
    match reader.next().await {
        None => Ok(None),
        Some(Ok(line)) => Ok(Some(line)),
        Some(Err(LinesCodecError::MaxLineLengthExceeded)) => Err(SessionError::Control(format!(
            "control line longer than {} bytes",
            MAX_CONTROL_LINE
        ))),
        Some(Err(LinesCodecError::Io(e))) => Err(e.into()),
    }
}

/// Why [`serve_control`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlExit {
    /// The peer finished or reset the control stream
    PeerClosed,
    Cancelled,
}

/// Ask the server for its upstream list
pub async fn request_discovery<R, W>(
    reader: &mut ControlReader<R>,
    writer: &mut W,
    deadline: Duration,
) -> SessionResult<Vec<UpstreamEndpoint>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_all(DISCOVERY_REQUEST.as_bytes()).await?;
    writer.flush().await?;

    let line = timeout(deadline, next_control_line(reader))
        .await
        .map_err(|_| SessionError::Control(format!("no discovery response within {:?}", deadline)))??
        .ok_or_else(|| {
            SessionError::Control("control stream closed before discovery response".to_string())
        })?;

    let endpoints = parse_discovery_response(&line)?;
    info!("Discovered {} upstream(s)", endpoints.len());
    Ok(endpoints)
}

/// Answer the session's discovery request and log heartbeats until the stream ends
///
/// Only the first discovery request is answered. Heartbeats get no reply.
pub async fn serve_control<R, W>(
    reader: &mut ControlReader<R>,
    writer: &mut W,
    endpoints: &[UpstreamEndpoint],
    cancel: &CancellationToken,
) -> SessionResult<ControlExit>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut discovered = false;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Ok(ControlExit::Cancelled),
            next = next_control_line(reader) => next,
        };

        let line = match next {
            Ok(Some(line)) => line,
            Ok(None) => return Ok(ControlExit::PeerClosed),
            Err(SessionError::Io(e)) => {
                debug!("Control stream read ended: {}", e);
                return Ok(ControlExit::PeerClosed);
            }
            Err(e) => return Err(e),
        };

        match parse_control_line(&line) {
            ControlMessage::DiscoveryRequest if discovered => {
                warn!("Ignoring repeated discovery request")
            }
            ControlMessage::DiscoveryRequest => {
                let response = encode_discovery_response(endpoints)?;
                writer.write_all(response.as_bytes()).await?;
                writer.flush().await?;
                discovered = true;
                debug!("Sent discovery response with {} upstream(s)", endpoints.len());
            }
            ControlMessage::Heartbeat => debug!("Heartbeat received"),
            ControlMessage::Unknown(other) => {
                warn!("Ignoring unknown control message: {:?}", other)
            }
        }
    }
}
