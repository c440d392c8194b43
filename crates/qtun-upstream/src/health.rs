//! Upstream liveness probes
//!
//! A probe peeks at the pooled connection under a short deadline. An upstream
//! that stays silent is healthy; one that has closed or errored is marked
//! unhealthy and its pooled connection is evicted.

use qtun_proto::UpstreamEndpoint;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::pool::ConnectionPool;
use crate::registry::{HealthState, UpstreamRegistry};

/// What a periodic pass does when it finds an unhealthy upstream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HealthPolicy {
    /// End the owning session
    #[default]
    TearDownSession,
    /// Refuse new routes to that upstream until it recovers
    IsolateEndpoint,
}

impl FromStr for HealthPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "teardown" | "tear-down" | "session" => Ok(HealthPolicy::TearDownSession),
            "isolate" | "endpoint" => Ok(HealthPolicy::IsolateEndpoint),
            other => Err(format!("Unknown health policy: {}", other)),
        }
    }
}

impl fmt::Display for HealthPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthPolicy::TearDownSession => write!(f, "teardown"),
            HealthPolicy::IsolateEndpoint => write!(f, "isolate"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Read deadline for a single probe; expiring means healthy
    pub probe_timeout: Duration,

    /// Time between periodic passes
    pub interval: Duration,

    pub policy: HealthPolicy,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(1),
            interval: Duration::from_secs(10),
            policy: HealthPolicy::default(),
        }
    }
}

/// Outcome of one pass over every endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub healthy: Vec<String>,
    pub unhealthy: Vec<String>,
}

impl HealthReport {
    pub fn all_healthy(&self) -> bool {
        self.unhealthy.is_empty()
    }
}

/// Why [`HealthSupervisor::run`] returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorExit {
    Cancelled,
    /// Only under [`HealthPolicy::TearDownSession`]
    Unhealthy(HealthReport),
}

#[derive(Debug, Clone)]
pub struct HealthSupervisor {
    registry: Arc<UpstreamRegistry>,
    pool: Arc<ConnectionPool>,
    config: HealthConfig,
}

impl HealthSupervisor {
    pub fn new(
        registry: Arc<UpstreamRegistry>,
        pool: Arc<ConnectionPool>,
        config: HealthConfig,
    ) -> Self {
        Self {
            registry,
            pool,
            config,
        }
    }

    pub fn policy(&self) -> HealthPolicy {
        self.config.policy
    }

    /// Probe every endpoint and record the result in the registry
    pub async fn check_all(&self) -> HealthReport {
        let mut report = HealthReport::default();

        for endpoint in self.registry.endpoints() {
            let key = endpoint.key();
            if self.probe(endpoint).await {
                self.registry.set_health(&key, HealthState::Healthy).await;
                report.healthy.push(key);
            } else {
                self.registry.set_health(&key, HealthState::Unhealthy).await;
                report.unhealthy.push(key);
            }
        }

        report
    }

    /// `true` when every endpoint passed
    pub async fn health_check_all(&self) -> bool {
        self.check_all().await.all_healthy()
    }

    async fn probe(&self, endpoint: &UpstreamEndpoint) -> bool {
        // Probe the pooled socket itself; a redial would hide a closed upstream
        let pooled = match self.pool.get(&endpoint.key()).await {
            Some(conn) => Ok(conn),
            None => self.pool.get_or_connect(endpoint).await,
        };
        let conn = match pooled {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Health check: {}", e);
                return false;
            }
        };

        // The deadline covers waiting for an in-flight exchange to release the socket
        let outcome = timeout(self.config.probe_timeout, async {
            let stream = conn.lock().await;
            let mut byte = [0u8; 1];
            stream.peek(&mut byte).await
        })
        .await;

        match outcome {
            Err(_) => {
                debug!("Health check: {} idle, healthy", conn.key());
                true
            }
            Ok(Ok(0)) => {
                warn!("Health check: {} closed the connection", conn.key());
                self.pool.evict(&conn).await;
                false
            }
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!("Health check: {} read error: {}", conn.key(), e);
                self.pool.evict(&conn).await;
                false
            }
        }
    }

    /// Run periodic passes until cancelled or, under the tear-down policy,
    /// until a pass finds an unhealthy upstream
    pub async fn run(&self, cancel: CancellationToken) -> SupervisorExit {
        let mut ticker = interval_at(Instant::now() + self.config.interval, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return SupervisorExit::Cancelled,
                _ = ticker.tick() => {}
            }

            let report = self.check_all().await;
            if report.all_healthy() {
                continue;
            }

            match self.config.policy {
                HealthPolicy::TearDownSession => {
                    error!("Unhealthy upstreams {:?}, tearing down session", report.unhealthy);
                    return SupervisorExit::Unhealthy(report);
                }
                HealthPolicy::IsolateEndpoint => {
                    warn!("Isolating unhealthy upstreams {:?}", report.unhealthy);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_parse() {
        assert_eq!("teardown".parse(), Ok(HealthPolicy::TearDownSession));
        assert_eq!("ISOLATE".parse(), Ok(HealthPolicy::IsolateEndpoint));
        assert!("sometimes".parse::<HealthPolicy>().is_err());
        assert_eq!(HealthPolicy::default().to_string(), "teardown");
    }
}
