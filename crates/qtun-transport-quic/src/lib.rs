//! QUIC transport using quinn
//!
//! Every connection is mutually authenticated: the server requires a client
//! certificate signed by one of its configured CA roots, the client verifies
//! the server against the same roots, and both sides insist on the
//! `quic-tunnel` ALPN tag.
//!
//! # Example
//!
//! ```no_run
//! use qtun_cert::TlsMaterial;
//! use qtun_transport::{TransportConnector, TransportListener};
//! use qtun_transport_quic::{QuicConfig, QuicConnector, QuicListener};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server_tls = TlsMaterial::from_pem_files("server.crt", "server.key", "ca.crt")?;
//! let listener = QuicListener::new("0.0.0.0:4433".parse()?, Arc::new(QuicConfig::new(server_tls)))?;
//!
//! let client_tls = TlsMaterial::from_pem_files("client.crt", "client.key", "ca.crt")?;
//! let connector = QuicConnector::new(Arc::new(QuicConfig::new(client_tls)))?;
//! let connection = connector.connect("127.0.0.1:4433".parse()?, "localhost").await?;
//! # Ok(())
//! # }
//! ```

// Must run before any rustls/QUIC configuration is built
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

pub mod config;
pub mod connection;
pub mod listener;
pub mod stream;

pub use config::QuicConfig;
pub use connection::QuicConnection;
pub use listener::{QuicConnector, QuicListener};
pub use stream::QuicStream;
