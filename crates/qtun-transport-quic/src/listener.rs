//! Mutually authenticated QUIC endpoints

use async_trait::async_trait;
use quinn::Endpoint;
use qtun_proto::ResetCode;
use qtun_transport::{
    TransportConfig, TransportConnector, TransportError, TransportListener, TransportResult,
};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::QuicConfig;
use crate::connection::{check_alpn, QuicConnection};

/// Server endpoint; yields only connections that passed mTLS and ALPN checks
#[derive(Debug)]
pub struct QuicListener {
    endpoint: Endpoint,
    config: Arc<QuicConfig>,
}

impl QuicListener {
    pub fn new(bind_addr: SocketAddr, config: Arc<QuicConfig>) -> TransportResult<Self> {
        TransportConfig::validate(&*config)?;

        let endpoint = Endpoint::server(config.build_server_config()?, bind_addr)
            .map_err(TransportError::IoError)?;
        info!(
            "Tunnel endpoint listening on {}",
            endpoint.local_addr().map_err(TransportError::IoError)?
        );

        Ok(Self { endpoint, config })
    }
}

#[async_trait]
impl TransportListener for QuicListener {
    type Connection = QuicConnection;

    async fn accept(&self) -> TransportResult<(Self::Connection, SocketAddr)> {
        loop {
            let Some(incoming) = self.endpoint.accept().await else {
                return Err(TransportError::ConnectionError("endpoint closed".to_string()));
            };

            let remote = incoming.remote_address();
            debug!("Handshake from {}", remote);

            let connection = match incoming.await {
                Ok(connection) => connection,
                Err(e) => {
                    warn!("QUIC handshake with {} failed: {}", remote, e);
                    continue;
                }
            };

            if let Err(e) = check_alpn(&connection, self.config.alpn_protocols()) {
                warn!("Rejecting connection from {}: {}", remote, e);
                connection.close(
                    ResetCode::MalformedFrame.as_u32().into(),
                    b"alpn mismatch",
                );
                continue;
            }

            info!("Peer {} authenticated", remote);
            return Ok((QuicConnection::new(connection), remote));
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.endpoint.local_addr().map_err(TransportError::IoError)
    }

    async fn close(&self) {
        self.endpoint
            .close(ResetCode::Shutdown.as_u32().into(), b"listener closed");
        info!("Tunnel endpoint closed");
    }
}

/// Client side; one fresh endpoint per connection
#[derive(Debug)]
pub struct QuicConnector {
    config: Arc<QuicConfig>,
    client_config: quinn::ClientConfig,
}

impl QuicConnector {
    pub fn new(config: Arc<QuicConfig>) -> TransportResult<Self> {
        TransportConfig::validate(&*config)?;

        Ok(Self {
            client_config: config.build_client_config()?,
            config,
        })
    }
}

#[async_trait]
impl TransportConnector for QuicConnector {
    type Connection = QuicConnection;

    async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
    ) -> TransportResult<Self::Connection> {
        debug!("Dialing {} as {}", addr, server_name);

        let bind: SocketAddr = if addr.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let mut endpoint = Endpoint::client(bind).map_err(TransportError::IoError)?;
        endpoint.set_default_client_config(self.client_config.clone());

        let connection = endpoint
            .connect(addr, server_name)
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?
            .await
            .map_err(|e| TransportError::TlsError(format!("handshake with {}: {}", addr, e)))?;

        if let Err(e) = check_alpn(&connection, self.config.alpn_protocols()) {
            connection.close(ResetCode::MalformedFrame.as_u32().into(), b"alpn mismatch");
            return Err(e);
        }

        info!("Authenticated to {} ({})", server_name, addr);

        Ok(QuicConnection::new(connection).with_endpoint(endpoint))
    }
}
