//! Tunnel server
//!
//! Accepts mutually authenticated sessions, answers discovery on the first
//! stream of each, and routes every further stream by its route header:
//!
//! - raw: spliced to a fresh connection to the named upstream
//! - chunked: each chunk answered over the pooled upstream connection
//! - packet: relayed to the server's packet device

pub mod config;
pub mod router;
pub mod server;

pub use config::ServerConfig;
pub use router::{RouteTarget, StreamRouter};
pub use server::{serve_session, TunnelServer};

use qtun_session::SessionError;
use qtun_transport::TransportError;
use qtun_upstream::UpstreamError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Route token does not match")]
    AuthMismatch,

    #[error("No route to {0}")]
    NoRoute(String),

    #[error("Unhealthy upstreams at startup: {0:?}")]
    UnhealthyUpstreams(Vec<String>),

    #[error("Invalid server configuration: {0}")]
    Config(String),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),
}

pub type ServerResult<T> = Result<T, ServerError>;
