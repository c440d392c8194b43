//! Tunnel client
//!
//! Connects to the server, learns the upstream list through discovery and
//! either exposes each upstream on a local TCP port or carries a packet
//! device over a single stream.

pub mod client;
pub mod config;
pub mod listener;

pub use client::{ClientSession, TunnelClient};
pub use config::{ClientConfig, ListenerConfig};
pub use listener::ListenerSet;

use qtun_relay::RelayError;
use qtun_session::SessionError;
use qtun_transport::TransportError;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Failed to listen on {addr}: {source}")]
    LocalListenFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to resolve {0}")]
    Resolve(String),

    #[error("Invalid client configuration: {0}")]
    Config(String),
}

impl ClientError {
    pub(crate) fn listen_failed(addr: SocketAddr, source: std::io::Error) -> Self {
        ClientError::LocalListenFailed {
            addr: addr.to_string(),
            source,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
