//! Configured upstream endpoints and their health

use qtun_proto::UpstreamEndpoint;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;

use crate::{UpstreamError, UpstreamResult};

/// Liveness of one upstream, as last observed by the health supervisor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HealthState {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// The static set of upstream endpoints this process routes to
///
/// The endpoint list never changes after construction. Health state is
/// written only by [`crate::HealthSupervisor`].
#[derive(Debug)]
pub struct UpstreamRegistry {
    endpoints: Vec<UpstreamEndpoint>,
    health: RwLock<HashMap<String, HealthState>>,
}

impl UpstreamRegistry {
    /// Duplicate `address:port` entries are collapsed, keeping the first
    pub fn new(endpoints: Vec<UpstreamEndpoint>) -> Self {
        let mut unique: Vec<UpstreamEndpoint> = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            if !unique.iter().any(|e| e.key() == endpoint.key()) {
                unique.push(endpoint);
            }
        }

        let health = unique
            .iter()
            .map(|e| (e.key(), HealthState::Unknown))
            .collect();

        Self {
            endpoints: unique,
            health: RwLock::new(health),
        }
    }

    pub fn endpoints(&self) -> &[UpstreamEndpoint] {
        &self.endpoints
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Find the endpoint a route's `remoteHost` names
    pub fn lookup(&self, remote_host: &str) -> Option<&UpstreamEndpoint> {
        self.endpoints.iter().find(|e| e.key() == remote_host)
    }

    /// Resolve a route's `remoteHost` to an endpoint that accepts new routes
    pub async fn resolve(&self, remote_host: &str) -> UpstreamResult<UpstreamEndpoint> {
        let endpoint = self
            .lookup(remote_host)
            .ok_or_else(|| UpstreamError::UnknownEndpoint(remote_host.to_string()))?;

        if !self.is_routable(&endpoint.key()).await {
            return Err(UpstreamError::Unhealthy(endpoint.key()));
        }

        Ok(endpoint.clone())
    }

    pub async fn health(&self, key: &str) -> HealthState {
        self.health
            .read()
            .await
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    /// Everything except endpoints known to be down accepts new routes
    pub async fn is_routable(&self, key: &str) -> bool {
        self.health(key).await != HealthState::Unhealthy
    }

    pub async fn snapshot(&self) -> Vec<(UpstreamEndpoint, HealthState)> {
        let health = self.health.read().await;
        self.endpoints
            .iter()
            .map(|e| (e.clone(), health.get(&e.key()).copied().unwrap_or_default()))
            .collect()
    }

    pub(crate) async fn set_health(&self, key: &str, state: HealthState) {
        let mut health = self.health.write().await;
        let previous = health.insert(key.to_string(), state);
        if previous != Some(state) {
            info!("Upstream {} is now {:?}", key, state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_and_dedup() {
        let registry = UpstreamRegistry::new(vec![
            UpstreamEndpoint::tcp("127.0.0.1", 9000),
            UpstreamEndpoint::tcp("127.0.0.1", 9000),
            UpstreamEndpoint::tcp("::1", 9001),
        ]);

        assert_eq!(registry.endpoints().len(), 2);
        assert!(registry.lookup("127.0.0.1:9000").is_some());
        assert!(registry.lookup("[::1]:9001").is_some());
        assert!(registry.lookup("127.0.0.1:9999").is_none());
    }

    #[tokio::test]
    async fn test_health_transitions() {
        let registry = UpstreamRegistry::new(vec![UpstreamEndpoint::tcp("127.0.0.1", 9000)]);
        let key = "127.0.0.1:9000";

        assert_eq!(registry.health(key).await, HealthState::Unknown);
        assert!(registry.is_routable(key).await);

        registry.set_health(key, HealthState::Unhealthy).await;
        assert!(!registry.is_routable(key).await);
        assert!(matches!(
            registry.resolve(key).await,
            Err(UpstreamError::Unhealthy(_))
        ));
        assert!(matches!(
            registry.resolve("10.0.0.1:9000").await,
            Err(UpstreamError::UnknownEndpoint(_))
        ));

        registry.set_health(key, HealthState::Healthy).await;
        assert_eq!(registry.resolve(key).await.unwrap().port, 9000);
        assert_eq!(
            registry.snapshot().await,
            vec![(UpstreamEndpoint::tcp("127.0.0.1", 9000), HealthState::Healthy)]
        );
    }
}
