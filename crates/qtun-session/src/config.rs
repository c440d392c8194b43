use std::time::Duration;

use crate::{SessionError, SessionResult};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Heartbeat period on the control stream
    pub keep_alive_interval: Duration,

    /// Silence after which the transport gives up on the peer
    pub idle_timeout: Duration,

    /// How long in-flight flows may run once shutdown starts
    pub grace_period: Duration,

    /// Upper bound on establishing the transport connection
    pub connect_timeout: Duration,

    /// Upper bound on the discovery exchange
    pub control_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            grace_period: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            control_timeout: Duration::from_secs(10),
        }
    }
}

impl SessionConfig {
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// The idle timeout must leave room for at least two heartbeats
    pub fn validate(&self) -> SessionResult<()> {
        if self.keep_alive_interval.is_zero() {
            return Err(SessionError::InvalidConfig(
                "keep-alive interval must be greater than zero".to_string(),
            ));
        }

        if self.idle_timeout < self.keep_alive_interval * 2 {
            return Err(SessionError::InvalidConfig(format!(
                "idle timeout {:?} must be at least twice the keep-alive interval {:?}",
                self.idle_timeout, self.keep_alive_interval
            )));
        }

        Ok(())
    }
}
