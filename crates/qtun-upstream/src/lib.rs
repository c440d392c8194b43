//! Upstream services reachable through the tunnel
//!
//! - [`UpstreamRegistry`]: the configured endpoints and their health state
//! - [`ConnectionPool`]: persistent connections keyed by `address:port`
//! - [`HealthSupervisor`]: startup and periodic liveness probes

pub mod health;
pub mod pool;
pub mod registry;

pub use health::{HealthConfig, HealthPolicy, HealthReport, HealthSupervisor, SupervisorExit};
pub use pool::{dial, ConnectionPool, PoolConfig, PooledConnection};
pub use registry::{HealthState, UpstreamRegistry};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Upstream {endpoint} unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },

    #[error("Upstream {endpoint} I/O error: {source}")]
    Io {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No upstream registered for {0}")]
    UnknownEndpoint(String),

    #[error("Upstream {0} is unhealthy")]
    Unhealthy(String),
}

pub type UpstreamResult<T> = Result<T, UpstreamError>;
