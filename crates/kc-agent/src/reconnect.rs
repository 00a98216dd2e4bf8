//! Reconnect backoff with jitter, attempt ceiling and circuit breaker limits.

use rand::Rng;
use std::time::Duration;

use kc_common::config::ReconnectConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub backoff_base: f64,
    pub max_delay: Duration,
    /// Reconnect attempts allowed before the breaker opens.
    pub max_attempts: u32,
    /// Consecutive heartbeat failures that open the breaker.
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(cfg: &ReconnectConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(cfg.initial_delay_ms),
            backoff_base: cfg.backoff_base.max(1.0),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            max_attempts: cfg.max_attempts,
            breaker_threshold: cfg.circuit_breaker_threshold.max(1),
            breaker_cooldown: Duration::from_secs(cfg.circuit_breaker_cooldown_secs),
        }
    }
}

impl ReconnectPolicy {
    /// `min(initial × base^(attempt-1), max)`, without jitter. Attempts start at 1.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_base.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Base delay plus jitter drawn uniformly from `[0, base/4]`.
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter_ms = (base.as_millis() / 4) as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        base + Duration::from_millis(jitter)
    }

    pub fn attempts_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    pub fn should_open_breaker(&self, consecutive_failures: u32) -> bool {
        consecutive_failures >= self.breaker_threshold
    }
}
