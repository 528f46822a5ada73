//! Retry pacing for control sessions lost to network or server restarts

use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

/// Backoff schedule for re-establishing a control session
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Ceiling for the growing delay
    pub max_backoff: Duration,
    /// Growth factor applied after each wait
    pub multiplier: f64,
    /// Give up after this many retries (None = keep trying)
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

#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("Max reconnection attempts reached")]
    MaxAttemptsReached,
}

/// Tracks the retry count and the current delay between session attempts
pub struct ReconnectManager {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Sleep out the current backoff, then grow it for the next round
    pub async fn wait(&mut self) -> Result<(), ReconnectError> {
        self.attempt += 1;

        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return Err(ReconnectError::MaxAttemptsReached);
            }
        }

        debug!(
            attempt = self.attempt,
            backoff_ms = self.current_backoff.as_millis() as u64,
            "Waiting before reconnection attempt"
        );

        sleep(self.current_backoff).await;

        let next_backoff =
            Duration::from_secs_f64(self.current_backoff.as_secs_f64() * self.config.multiplier);
        self.current_backoff = next_backoff.min(self.config.max_backoff);

        Ok(())
    }

    /// Restart the schedule after a session that reached `HelloAck`
    pub fn reset(&mut self) {
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config(max_attempts: Option<usize>) -> ReconnectConfig {
        ReconnectConfig {
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(40),
            multiplier: 2.0,
            max_attempts,
        }
    }

    #[tokio::test]
    async fn backoff_doubles_until_the_cap() {
        let mut manager = ReconnectManager::new(fast_config(None));

        assert_eq!(manager.attempt(), 0);
        assert_eq!(manager.current_backoff(), Duration::from_millis(5));

        manager.wait().await.unwrap();
        assert_eq!(manager.current_backoff(), Duration::from_millis(10));

        manager.wait().await.unwrap();
        assert_eq!(manager.current_backoff(), Duration::from_millis(20));

        manager.wait().await.unwrap();
        assert_eq!(manager.current_backoff(), Duration::from_millis(40));

        manager.wait().await.unwrap();
        assert_eq!(manager.attempt(), 4);
        assert_eq!(manager.current_backoff(), Duration::from_millis(40));
    }

    #[tokio::test]
    async fn reset_restores_the_initial_delay() {
        let mut manager = ReconnectManager::new(fast_config(None));

        manager.wait().await.unwrap();
        manager.wait().await.unwrap();
        assert_eq!(manager.attempt(), 2);

        manager.reset();

        assert_eq!(manager.attempt(), 0);
        assert_eq!(manager.current_backoff(), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn bounded_attempts_run_out() {
        let mut manager = ReconnectManager::new(fast_config(Some(2)));

        assert!(manager.wait().await.is_ok());
        assert!(manager.wait().await.is_ok());

        let result = manager.wait().await;
        assert!(matches!(result, Err(ReconnectError::MaxAttemptsReached)));
    }
}
