//! Exponential backoff for store delivery retries.
//!
//! Delivery never gives up: there is no attempt limit or overall timeout,
//! only a growing delay capped at `max_delay`.

use std::time::{Duration, Instant};

use crate::config::IngestConfig;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial retry delay
    pub initial_delay: Duration,

    /// Maximum retry delay
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f32,

    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl From<&IngestConfig> for RetryConfig {
    fn from(config: &IngestConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.send_retry_initial_ms),
            max_delay: Duration::from_millis(config.send_retry_max_ms.max(config.send_retry_initial_ms)),
            ..Self::default()
        }
    }
}

/// Exponential backoff implementation
pub struct ExponentialBackoff {
    config: RetryConfig,
    attempt: u32,
    start_time: Instant,
}

impl ExponentialBackoff {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempt: 0,
            start_time: Instant::now(),
        }
    }

    /// Calculate delay for next retry
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);

        // Exponent is capped so the float never overflows on long outages.
        let exponent = (self.attempt - 1).min(32) as i32;
        let base_ms = self.config.initial_delay.as_millis() as f64
            * f64::from(self.config.backoff_multiplier).powi(exponent);
        let capped_delay = Duration::from_millis(base_ms as u64).min(self.config.max_delay);

        // Add jitter to avoid thundering herd
        let jitter = if self.config.jitter_factor > 0.0 {
            let jitter_ms = (capped_delay.as_millis() as f32 * self.config.jitter_factor) as u64;
            Duration::from_millis(fastrand::u64(0..=jitter_ms))
        } else {
            Duration::ZERO
        };

        capped_delay + jitter
    }

    /// Get current attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Get elapsed time since start
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}
