use qtun_proto::UpstreamEndpoint;
use qtun_relay::TunnelConfig;
use qtun_session::SessionConfig;
use qtun_upstream::{HealthConfig, PoolConfig};
use std::net::SocketAddr;

use crate::{ServerError, ServerResult};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// UDP address the QUIC endpoint binds
    pub listen: SocketAddr,

    /// Upstreams offered to clients through discovery
    pub upstreams: Vec<UpstreamEndpoint>,

    /// Token every route header must carry
    pub secret: String,

    pub session: SessionConfig,
    pub health: HealthConfig,
    pub pool: PoolConfig,
    pub tunnel: TunnelConfig,
}

impl ServerConfig {
    pub fn new(listen: SocketAddr, upstreams: Vec<UpstreamEndpoint>, secret: impl Into<String>) -> Self {
        Self {
            listen,
            upstreams,
            secret: secret.into(),
            session: SessionConfig::default(),
            health: HealthConfig::default(),
            pool: PoolConfig::default(),
            tunnel: TunnelConfig::default(),
        }
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.tunnel.debug = debug;
        self
    }

    pub fn validate(&self) -> ServerResult<()> {
        if self.secret.is_empty() {
            return Err(ServerError::Config("secret must not be empty".to_string()));
        }
        self.session.validate()?;
        Ok(())
    }
}
