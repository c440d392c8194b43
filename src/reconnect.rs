//! Reconnection backoff for the client

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// `None` retries forever
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

/// Why [`Backoff::wait`] refused another attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUp {
    MaxAttemptsReached,
    Cancelled,
}

pub struct Backoff {
    config: ReconnectConfig,
    current: Duration,
    attempt: usize,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Sleep before the next attempt, growing the delay each time
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), GiveUp> {
        self.attempt += 1;

        if let Some(max) = self.config.max_attempts {
            if self.attempt > max {
                return Err(GiveUp::MaxAttemptsReached);
            }
        }

        debug!(
            "Waiting {:?} before reconnection attempt {}",
            self.current, self.attempt
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(GiveUp::Cancelled),
            _ = tokio::time::sleep(self.current) => {}
        }

        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.config.multiplier);
        self.current = next.min(self.config.max_backoff);
        Ok(())
    }

    /// Start over after a session that actually came up
    pub fn reset(&mut self) {
        self.current = self.config.initial_backoff;
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> ReconnectConfig {
        ReconnectConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(25),
            multiplier: 2.0,
            max_attempts: Some(3),
        }
    }

    #[tokio::test]
    async fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(fast());
        let cancel = CancellationToken::new();

        backoff.wait(&cancel).await.unwrap();
        assert_eq!(backoff.current, Duration::from_millis(20));
        backoff.wait(&cancel).await.unwrap();
        assert_eq!(backoff.current, Duration::from_millis(25));
        backoff.wait(&cancel).await.unwrap();
        assert_eq!(backoff.wait(&cancel).await, Err(GiveUp::MaxAttemptsReached));

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.current, Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_cancelled_wait() {
        let mut backoff = Backoff::new(ReconnectConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(backoff.wait(&cancel).await, Err(GiveUp::Cancelled));
    }
}
