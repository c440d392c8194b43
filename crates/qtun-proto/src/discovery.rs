//! Control stream literals
//!
//! The client opens the first stream of a session and writes
//! [`DISCOVERY_REQUEST`]. The server answers with
//! `quic-clients: [{"address":..,"port":..,"protocol":..}]\n` and the stream
//! then carries only [`HEARTBEAT`] lines.

use crate::codec::FrameError;
use crate::upstream::UpstreamEndpoint;

pub const DISCOVERY_REQUEST: &str = "quic-clients\n";
pub const DISCOVERY_RESPONSE_PREFIX: &str = "quic-clients: ";
pub const HEARTBEAT: &str = "quic-ping\n";

/// A line read from the control stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    DiscoveryRequest,
    Heartbeat,
    Unknown(String),
}

pub fn parse_control_line(line: &str) -> ControlMessage {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed == DISCOVERY_REQUEST.trim_end() {
        ControlMessage::DiscoveryRequest
    } else if trimmed == HEARTBEAT.trim_end() {
        ControlMessage::Heartbeat
    } else {
        ControlMessage::Unknown(trimmed.to_string())
    }
}

/// Build the discovery response line, newline included
pub fn encode_discovery_response(endpoints: &[UpstreamEndpoint]) -> Result<String, FrameError> {
    let list = serde_json::to_string(endpoints).map_err(|e| FrameError::Malformed(e.to_string()))?;
    Ok(format!("{}{}\n", DISCOVERY_RESPONSE_PREFIX, list))
}

/// Parse a discovery response line
pub fn parse_discovery_response(line: &str) -> Result<Vec<UpstreamEndpoint>, FrameError> {
    let body = line
        .trim_end_matches(['\r', '\n'])
        .strip_prefix(DISCOVERY_RESPONSE_PREFIX)
        .ok_or_else(|| {
            FrameError::Malformed(format!("unexpected discovery response: {:?}", line))
        })?;

    serde_json::from_str(body)
        .map_err(|e| FrameError::Malformed(format!("invalid upstream list: {}", e)))
}
