//! Wire protocol for the QUIC tunnel
//!
//! Everything that travels on a tunnel stream is defined here:
//!
//! - [`RouteDescriptor`]: routing metadata attached to a data stream
//! - [`UpstreamEndpoint`]: one configured upstream TCP service
//! - [`codec`]: the sentinel frame `0x00000000 | JSON | 0x00000000 | payload`
//! - [`datagram`]: length-prefixed frames for chunked and packet streams
//! - [`discovery`]: the literal control-stream exchange and heartbeat

pub mod codec;
pub mod datagram;
pub mod discovery;
pub mod route;
pub mod upstream;

pub use codec::{decode_frame, encode_frame, read_route_header, FrameError, FrameResult, SENTINEL};
pub use datagram::{packet_codec, ChunkCodec, ChunkFrame, MAX_CHUNK_SIZE, MAX_PACKET_FRAME};
pub use discovery::{
    encode_discovery_response, parse_control_line, parse_discovery_response, ControlMessage,
    DISCOVERY_REQUEST, DISCOVERY_RESPONSE_PREFIX, HEARTBEAT,
};
pub use route::{Framing, RouteDescriptor};
pub use upstream::{
    join_host_port, parse_upstream_list, UpstreamEndpoint, UpstreamParseError, UpstreamProtocol,
};

/// ALPN tag both peers must negotiate
pub const ALPN_PROTOCOL: &str = "quic-tunnel";

/// Application error codes used when a stream or connection is torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResetCode {
    Normal = 0,
    AuthMismatch = 1,
    NoRoute = 2,
    MalformedFrame = 3,
    UpstreamUnreachable = 4,
    UpstreamUnhealthy = 5,
    Shutdown = 6,
}

impl ResetCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}
