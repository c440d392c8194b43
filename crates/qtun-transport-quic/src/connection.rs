//! Session connections over quinn

use async_trait::async_trait;
use quinn::{Connection, Endpoint};
use qtun_transport::{
    ConnectionStats, PeerIdentity, TransportConnection, TransportError, TransportResult,
};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, error, trace};

use crate::stream::QuicStream;

/// QUIC connection wrapper
#[derive(Debug, Clone)]
pub struct QuicConnection {
    inner: Connection,
    connection_id: String,
    created_at: Instant,
    // Client connections keep their endpoint alive for as long as they exist
    _endpoint: Option<Endpoint>,
}

impl QuicConnection {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection_id: format!("qtun-{}", connection.stable_id()),
            inner: connection,
            created_at: Instant::now(),
            _endpoint: None,
        }
    }

    pub(crate) fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self._endpoint = Some(endpoint);
        self
    }

    pub fn inner(&self) -> &Connection {
        &self.inner
    }

    /// ALPN protocol agreed during the handshake
    pub fn negotiated_alpn(&self) -> Option<Vec<u8>> {
        negotiated_alpn(&self.inner)
    }
}

pub(crate) fn negotiated_alpn(connection: &Connection) -> Option<Vec<u8>> {
    let data = connection.handshake_data()?;
    let data = data
        .downcast::<quinn::crypto::rustls::HandshakeData>()
        .ok()?;
    data.protocol
}

/// Reject connections whose negotiated ALPN is not one we offered
pub(crate) fn check_alpn(connection: &Connection, expected: &[String]) -> TransportResult<()> {
    match negotiated_alpn(connection) {
        Some(proto) if expected.iter().any(|e| e.as_bytes() == proto.as_slice()) => Ok(()),
        Some(proto) => Err(TransportError::ProtocolError(format!(
            "unexpected ALPN protocol {:?}",
            String::from_utf8_lossy(&proto)
        ))),
        None => Err(TransportError::ProtocolError(
            "no ALPN protocol negotiated".to_string(),
        )),
    }
}

#[async_trait]
impl TransportConnection for QuicConnection {
    type Stream = QuicStream;

    async fn open_stream(&self) -> TransportResult<Self::Stream> {
        let (send, recv) = self
            .inner
            .open_bi()
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        trace!(stream = send.id().index(), "Opened stream");
        Ok(QuicStream::new(send, recv))
    }

    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>> {
        use quinn::ConnectionError as E;

        match self.inner.accept_bi().await {
            Ok((send, recv)) => {
                trace!(stream = send.id().index(), "Peer opened stream");
                Ok(Some(QuicStream::new(send, recv)))
            }
            // Every orderly end of the connection is end-of-streams for the session
            Err(
                e @ (E::ApplicationClosed(_)
                | E::ConnectionClosed(_)
                | E::LocallyClosed
                | E::TimedOut
                | E::Reset),
            ) => {
                debug!("{} stopped accepting streams: {}", self.connection_id, e);
                Ok(None)
            }
            Err(e) => {
                error!("{} stream accept failed: {}", self.connection_id, e);
                Err(TransportError::ConnectionError(e.to_string()))
            }
        }
    }

    async fn close(&self, error_code: u32, reason: &str) {
        self.inner
            .close(quinn::VarInt::from_u32(error_code), reason.as_bytes());

        debug!(code = error_code, "Closed {}: {}", self.connection_id, reason);
    }

    async fn closed(&self) -> String {
        self.inner.closed().await.to_string()
    }

    fn is_closed(&self) -> bool {
        self.inner.close_reason().is_some()
    }

    fn remote_address(&self) -> SocketAddr {
        self.inner.remote_address()
    }

    fn peer_identity(&self) -> PeerIdentity {
        let certificates = self
            .inner
            .peer_identity()
            .and_then(|identity| {
                identity
                    .downcast::<Vec<quinn::rustls::pki_types::CertificateDer<'static>>>()
                    .ok()
            })
            .map(|chain| chain.iter().map(|c| c.to_vec()).collect())
            .unwrap_or_default();

        PeerIdentity { certificates }
    }

    fn stats(&self) -> ConnectionStats {
        let stats = self.inner.stats();

        ConnectionStats {
            bytes_sent: stats.udp_tx.bytes,
            bytes_received: stats.udp_rx.bytes,
            rtt_ms: Some(stats.path.rtt.as_millis() as u32),
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }

    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }
}
