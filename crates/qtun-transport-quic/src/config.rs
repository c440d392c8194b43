//! Endpoint settings and the rustls/quinn configs built from them

use qtun_cert::TlsMaterial;
use qtun_transport::{TransportConfig, TransportError, TransportResult, TransportSecurityConfig};
use std::sync::Arc;
use std::time::Duration;

/// Settings shared by both ends of a tunnel connection
#[derive(Debug, Clone)]
pub struct QuicConfig {
    security: TransportSecurityConfig,

    /// Local identity plus the CA roots used to verify the peer
    tls: Arc<TlsMaterial>,

    pub keep_alive_interval: Duration,

    /// Connection is dropped after this long without traffic
    pub max_idle_timeout: Duration,

    /// Maximum number of concurrent bidirectional streams the peer may open
    pub max_concurrent_streams: u64,
}

impl QuicConfig {
    pub fn new(tls: TlsMaterial) -> Self {
        Self {
            security: TransportSecurityConfig::default(),
            tls: Arc::new(tls),
            keep_alive_interval: Duration::from_secs(10),
            max_idle_timeout: Duration::from_secs(30),
            max_concurrent_streams: 1024,
        }
    }

    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.max_idle_timeout = timeout;
        self
    }

    pub fn with_max_streams(mut self, max: u64) -> Self {
        self.max_concurrent_streams = max;
        self
    }

    pub fn with_alpn_protocols(mut self, protocols: Vec<String>) -> Self {
        self.security.alpn_protocols = protocols;
        self
    }

    pub fn alpn_protocols(&self) -> &[String] {
        &self.security.alpn_protocols
    }

    fn alpn_bytes(&self) -> Vec<Vec<u8>> {
        self.security
            .alpn_protocols
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect()
    }

    fn roots(&self) -> TransportResult<quinn::rustls::RootCertStore> {
        let mut roots = quinn::rustls::RootCertStore::empty();
        for cert in &self.tls.roots {
            roots
                .add(cert.clone())
                .map_err(|e| TransportError::ConfigurationError(format!("Invalid root cert: {}", e)))?;
        }
        Ok(roots)
    }

    fn transport(&self) -> TransportResult<quinn::TransportConfig> {
        let idle = quinn::IdleTimeout::try_from(self.max_idle_timeout).map_err(|e| {
            TransportError::ConfigurationError(format!("Invalid idle timeout: {}", e))
        })?;
        let streams = quinn::VarInt::try_from(self.max_concurrent_streams).map_err(|e| {
            TransportError::ConfigurationError(format!("Invalid stream limit: {}", e))
        })?;

        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(self.keep_alive_interval));
        transport.max_idle_timeout(Some(idle));
        transport.max_concurrent_bidi_streams(streams);
        transport.max_concurrent_uni_streams(0u8.into());
        Ok(transport)
    }

    /// Build quinn ClientConfig presenting our certificate
    pub(crate) fn build_client_config(&self) -> TransportResult<quinn::ClientConfig> {
        crate::ensure_crypto_provider();

        let mut client_crypto = quinn::rustls::ClientConfig::builder()
            .with_root_certificates(self.roots()?)
            .with_client_auth_cert(self.tls.cert_chain.clone(), self.tls.key.clone_key())
            .map_err(|e| TransportError::TlsError(format!("client identity rejected: {}", e)))?;

        client_crypto.alpn_protocols = self.alpn_bytes();

        let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .map_err(|e| TransportError::TlsError(e.to_string()))?;
        let mut config = quinn::ClientConfig::new(Arc::new(crypto));
        config.transport_config(Arc::new(self.transport()?));
        Ok(config)
    }

    /// Build quinn ServerConfig that requires a client certificate
    pub(crate) fn build_server_config(&self) -> TransportResult<quinn::ServerConfig> {
        crate::ensure_crypto_provider();

        let verifier =
            quinn::rustls::server::WebPkiClientVerifier::builder(Arc::new(self.roots()?))
                .build()
                .map_err(|e| TransportError::TlsError(format!("Client verifier: {}", e)))?;

        let mut server_crypto = quinn::rustls::ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.tls.cert_chain.clone(), self.tls.key.clone_key())
            .map_err(|e| TransportError::TlsError(format!("server identity rejected: {}", e)))?;

        server_crypto.alpn_protocols = self.alpn_bytes();

        let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .map_err(|e| TransportError::TlsError(e.to_string()))?;
        let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        config.transport_config(Arc::new(self.transport()?));
        Ok(config)
    }
}

impl TransportConfig for QuicConfig {
    fn security_config(&self) -> &TransportSecurityConfig {
        &self.security
    }

    fn validate(&self) -> TransportResult<()> {
        if self.keep_alive_interval.is_zero() {
            return Err(TransportError::ConfigurationError(
                "keep-alive interval is zero".to_string(),
            ));
        }

        if self.max_idle_timeout < self.keep_alive_interval * 2 {
            return Err(TransportError::ConfigurationError(
                format!(
                    "idle timeout {:?} leaves room for fewer than two keep-alives of {:?}",
                    self.max_idle_timeout, self.keep_alive_interval
                ),
            ));
        }

        if self.security.alpn_protocols.is_empty() {
            return Err(TransportError::ConfigurationError(
                "no ALPN protocol configured".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material() -> TlsMaterial {
        let (server, _) = qtun_cert::dev_material().unwrap();
        server
    }

    #[test]
    fn test_defaults() {
        let config = QuicConfig::new(material());
        assert_eq!(config.keep_alive_interval, Duration::from_secs(10));
        assert_eq!(config.max_idle_timeout, Duration::from_secs(30));
        assert_eq!(config.alpn_protocols(), &["quic-tunnel".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sub_second_keep_alive_is_valid() {
        let config = QuicConfig::new(material())
            .with_keep_alive(Duration::from_millis(200))
            .with_idle_timeout(Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_timing_and_alpn() {
        let config = QuicConfig::new(material()).with_idle_timeout(Duration::from_secs(1));
        assert!(config.validate().is_err());

        let config = QuicConfig::new(material()).with_keep_alive(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = QuicConfig::new(material()).with_alpn_protocols(vec![]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builds_both_sides() {
        let config = QuicConfig::new(material());
        assert!(config.build_server_config().is_ok());
        assert!(config.build_client_config().is_ok());
    }
}
