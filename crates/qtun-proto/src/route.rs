//! Routing metadata carried at the head of every data stream

use serde::{Deserialize, Serialize};

use crate::upstream::{UpstreamEndpoint, UpstreamProtocol};

/// How the bytes following the route header are carried
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// Opaque byte stream spliced to a dedicated upstream connection
    #[default]
    Raw,
    /// Length-prefixed chunks, each answered over the pooled upstream connection
    Chunked,
    /// Length-prefixed IP packets for full-tunnel mode
    Packet,
}

impl Framing {
    pub fn is_raw(&self) -> bool {
        matches!(self, Framing::Raw)
    }
}

/// Route descriptor
///
/// The JSON field names are part of the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDescriptor {
    /// Shared secret; must match the server's configured token
    #[serde(rename = "apiKey")]
    pub token: String,

    /// Upstream `host:port` the stream is routed to
    #[serde(rename = "remoteHost")]
    pub remote_host: String,

    pub protocol: UpstreamProtocol,

    /// Client-facing `host:port` the connection was accepted on
    #[serde(rename = "clientHost", default)]
    pub client_host: String,

    /// Identifier of the owning stream
    #[serde(rename = "streamid", default)]
    pub stream_id: u64,

    #[serde(default, skip_serializing_if = "Framing::is_raw")]
    pub framing: Framing,
}

impl RouteDescriptor {
    pub fn new(token: impl Into<String>, upstream: &UpstreamEndpoint) -> Self {
        Self {
            token: token.into(),
            remote_host: upstream.key(),
            protocol: upstream.protocol,
            client_host: String::new(),
            stream_id: 0,
            framing: Framing::Raw,
        }
    }

    /// Descriptor for a full-tunnel packet stream, which names no upstream
    pub fn packet(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            remote_host: String::new(),
            protocol: UpstreamProtocol::Tcp,
            client_host: String::new(),
            stream_id: 0,
            framing: Framing::Packet,
        }
    }

    pub fn with_client_host(mut self, client_host: impl Into<String>) -> Self {
        self.client_host = client_host.into();
        self
    }

    pub fn with_stream_id(mut self, stream_id: u64) -> Self {
        self.stream_id = stream_id;
        self
    }

    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    /// Copy of this descriptor with the token blanked, for logging and replies
    pub fn redacted(&self) -> Self {
        Self {
            token: String::new(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_field_names() {
        let route = RouteDescriptor::new("secret", &UpstreamEndpoint::tcp("127.0.0.1", 9000))
            .with_client_host("127.0.0.1:40000")
            .with_stream_id(4);

        let value: serde_json::Value = serde_json::to_value(&route).unwrap();
        assert_eq!(value["apiKey"], "secret");
        assert_eq!(value["remoteHost"], "127.0.0.1:9000");
        assert_eq!(value["protocol"], "tcp");
        assert_eq!(value["clientHost"], "127.0.0.1:40000");
        assert_eq!(value["streamid"], 4);
        assert!(value.get("framing").is_none());
    }

    #[test]
    fn test_packet_route() {
        let route = RouteDescriptor::packet("secret");
        let json = serde_json::to_string(&route).unwrap();
        assert!(json.contains("\"framing\":\"packet\""));
        assert!(route.remote_host.is_empty());
    }

    #[test]
    fn test_framing_defaults_to_raw() {
        let route: RouteDescriptor = serde_json::from_str(
            r#"{"apiKey":"k","remoteHost":"10.0.0.1:22","protocol":"tcp"}"#,
        )
        .unwrap();
        assert_eq!(route.framing, Framing::Raw);
        assert_eq!(route.stream_id, 0);
    }
}
