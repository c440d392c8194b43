use qtun_proto::Framing;
use qtun_relay::TunnelConfig;
use qtun_session::SessionConfig;
use std::collections::HashMap;
use std::net::IpAddr;

use crate::{ClientError, ClientResult};

/// Where and how upstreams are exposed locally
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Host every local listener binds
    pub bind_host: IpAddr,

    /// Upstream port -> local port; unmapped upstreams listen on their own port
    pub port_map: HashMap<u16, u16>,

    /// Stream framing for forwarded connections
    pub framing: Framing,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::from([127, 0, 0, 1]),
            port_map: HashMap::new(),
            framing: Framing::Raw,
        }
    }
}

impl ListenerConfig {
    pub fn with_bind_host(mut self, host: IpAddr) -> Self {
        self.bind_host = host;
        self
    }

    pub fn with_remap(mut self, remote: u16, local: u16) -> Self {
        self.port_map.insert(remote, local);
        self
    }

    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    /// Local port for an upstream listening on `remote`
    pub fn local_port(&self, remote: u16) -> u16 {
        self.port_map.get(&remote).copied().unwrap_or(remote)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server `host:port`
    pub server: String,

    /// Name the server certificate must carry
    pub server_name: String,

    /// Token sent in every route header
    pub secret: String,

    pub session: SessionConfig,
    pub listener: ListenerConfig,
    pub tunnel: TunnelConfig,
}

impl ClientConfig {
    pub fn new(server: impl Into<String>, server_name: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            server_name: server_name.into(),
            secret: secret.into(),
            session: SessionConfig::default(),
            listener: ListenerConfig::default(),
            tunnel: TunnelConfig::default(),
        }
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_listener(mut self, listener: ListenerConfig) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.tunnel.debug = debug;
        self
    }

    pub fn validate(&self) -> ClientResult<()> {
        if self.secret.is_empty() {
            return Err(ClientError::Config("secret must not be empty".to_string()));
        }
        if self.listener.framing == Framing::Packet {
            return Err(ClientError::Config(
                "packet framing is only used in full-tunnel mode".to_string(),
            ));
        }
        self.session.validate()?;
        Ok(())
    }
}
