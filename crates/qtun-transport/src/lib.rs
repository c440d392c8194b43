//! Transport abstraction for tunnel sessions
//!
//! The session, relay and runtime crates only talk to these traits, so the
//! same session logic runs over QUIC in production and over the in-memory
//! transport in [`memory`] in tests.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │   qtun-session / qtun-client / qtun-server    │
//! └──────────────────────────────────────────────┘
//!                       │ uses traits
//!                       ↓
//! ┌──────────────────────────────────────────────┐
//! │  TransportListener    TransportConnection     │
//! │  TransportConnector   TransportStream         │
//! └──────────────────────────────────────────────┘
//!                       │ implemented by
//!                       ↓
//! ┌─────────────────────┬────────────────────────┐
//! │ qtun-transport-quic │ memory (tests)         │
//! └─────────────────────┴────────────────────────┘
//! ```

pub mod memory;

use async_trait::async_trait;
use std::fmt::Debug;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// An ordered, reliable, bidirectional byte channel inside a connection
///
/// Reads return `Ok(0)` once the peer finished its sending side. Shutting down
/// the writer finishes ours.
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + Debug + 'static {
    type ReadHalf: AsyncRead + Send + Unpin + 'static;
    type WriteHalf: AsyncWrite + Send + Unpin + 'static;

    /// Stream ID, unique within the connection
    fn stream_id(&self) -> u64;

    /// Abort both directions with an application error code
    fn reset(self, error_code: u32);

    /// Split into independently owned halves
    fn into_split(self) -> (Self::ReadHalf, Self::WriteHalf);
}

/// A multiplexed connection to one peer
#[async_trait]
pub trait TransportConnection: Send + Sync + Debug + 'static {
    type Stream: TransportStream;

    /// Open a new bidirectional stream
    async fn open_stream(&self) -> TransportResult<Self::Stream>;

    /// Accept an incoming bidirectional stream
    ///
    /// Returns `None` when the connection is closed and no more streams will arrive.
    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>>;

    /// Close the connection; every open stream fails afterwards
    async fn close(&self, error_code: u32, reason: &str);

    /// Resolves once the connection is closed, with a description of why
    async fn closed(&self) -> String;

    fn is_closed(&self) -> bool;

    fn remote_address(&self) -> SocketAddr;

    /// Certificates the peer presented during the handshake
    fn peer_identity(&self) -> PeerIdentity;

    fn stats(&self) -> ConnectionStats;

    /// Stable identifier for logging
    fn connection_id(&self) -> String;
}

/// Identity a peer proved during the handshake
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerIdentity {
    /// DER certificate chain, leaf first
    pub certificates: Vec<Vec<u8>>,
}

impl PeerIdentity {
    pub fn is_authenticated(&self) -> bool {
        !self.certificates.is_empty()
    }

    pub fn leaf(&self) -> Option<&[u8]> {
        self.certificates.first().map(Vec::as_slice)
    }
}

/// Statistics about a connection
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Round-trip time estimate (milliseconds)
    pub rtt_ms: Option<u32>,
    pub uptime_secs: u64,
}

/// Server side: accepts incoming connections
#[async_trait]
pub trait TransportListener: Send + Sync + Debug {
    type Connection: TransportConnection;

    /// Accept the next connection that completes its handshake
    ///
    /// Failed handshakes are logged and skipped; an error means the listener
    /// itself is gone.
    async fn accept(&self) -> TransportResult<(Self::Connection, SocketAddr)>;

    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Stop accepting new connections
    async fn close(&self);
}

/// Client side: establishes outgoing connections
#[async_trait]
pub trait TransportConnector: Send + Sync + Debug {
    type Connection: TransportConnection;

    /// Connect to a remote server
    ///
    /// `server_name` is checked against the server certificate.
    async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
    ) -> TransportResult<Self::Connection>;
}

/// Security settings shared by every transport
#[derive(Debug, Clone)]
pub struct TransportSecurityConfig {
    /// Application-Layer Protocol Negotiation (ALPN) protocols
    pub alpn_protocols: Vec<String>,
}

impl Default for TransportSecurityConfig {
    fn default() -> Self {
        Self {
            alpn_protocols: vec!["quic-tunnel".to_string()],
        }
    }
}

/// Transport-specific configuration
pub trait TransportConfig: Send + Sync + Debug {
    fn security_config(&self) -> &TransportSecurityConfig;

    fn validate(&self) -> TransportResult<()>;
}
