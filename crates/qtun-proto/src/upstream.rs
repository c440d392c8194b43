//! Upstream endpoint definitions and the `host:port/protocol` list format

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Transport protocol of an upstream service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamProtocol {
    Tcp,
}

impl fmt::Display for UpstreamProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamProtocol::Tcp => write!(f, "tcp"),
        }
    }
}

impl FromStr for UpstreamProtocol {
    type Err = UpstreamParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(UpstreamProtocol::Tcp),
            other => Err(UpstreamParseError::UnsupportedProtocol(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UpstreamParseError {
    #[error("empty upstream entry")]
    Empty,

    #[error("upstream entry '{0}' must look like host:port/protocol")]
    MissingProtocol(String),

    #[error("upstream entry '{0}' has no port")]
    MissingPort(String),

    #[error("invalid port '{0}'")]
    InvalidPort(String),

    #[error("unsupported upstream protocol '{0}'")]
    UnsupportedProtocol(String),
}

/// A configured upstream TCP service, as exchanged during discovery
///
/// On the wire the port is a string (`{"address":"127.0.0.1","port":"9000","protocol":"tcp"}`);
/// numeric ports are accepted on input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UpstreamEndpoint {
    pub address: String,
    #[serde(serialize_with = "port_as_string", deserialize_with = "port_from_any")]
    pub port: u16,
    pub protocol: UpstreamProtocol,
}

impl UpstreamEndpoint {
    pub fn tcp(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            protocol: UpstreamProtocol::Tcp,
        }
    }

    /// Pool/registry key, `address:port` with IPv6 literals bracketed
    pub fn key(&self) -> String {
        join_host_port(&self.address, self.port)
    }
}

impl fmt::Display for UpstreamEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.key(), self.protocol)
    }
}

impl FromStr for UpstreamEndpoint {
    type Err = UpstreamParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let entry = s.trim();
        if entry.is_empty() {
            return Err(UpstreamParseError::Empty);
        }

        let (hostport, protocol) = entry
            .rsplit_once('/')
            .ok_or_else(|| UpstreamParseError::MissingProtocol(entry.to_string()))?;
        let protocol = protocol.parse::<UpstreamProtocol>()?;

        let (host, port) = split_host_port(hostport)
            .ok_or_else(|| UpstreamParseError::MissingPort(hostport.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| UpstreamParseError::InvalidPort(port.to_string()))?;

        Ok(Self {
            address: host.to_string(),
            port,
            protocol,
        })
    }
}

/// Parse a comma-separated `host:port/protocol` list
///
/// Blank entries (for example a trailing comma) are skipped.
pub fn parse_upstream_list(list: &str) -> Result<Vec<UpstreamEndpoint>, UpstreamParseError> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::parse)
        .collect()
}

/// Join host and port, bracketing IPv6 literals
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn split_host_port(s: &str) -> Option<(&str, &str)> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?;
        return Some((host, port));
    }
    let (host, port) = s.rsplit_once(':')?;
    if host.is_empty() || host.contains(':') {
        return None;
    }
    Some((host, port))
}

fn port_as_string<S: Serializer>(port: &u16, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&port.to_string())
}

fn port_from_any<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Text(String),
        Number(u16),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(n) => Ok(n),
        Port::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid port '{}'", s))),
    }
}
