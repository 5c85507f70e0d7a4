//! Reconnection Backoff
//!
//! Exponential backoff for stream reconnection: the delay after the n-th
//! consecutive failure is `unit * base^n`, capped at `max_delay`, with
//! optional jitter. After `max_attempts` consecutive failures the policy
//! stops producing delays and the supervisor gives up.

use std::time::Duration;

use rand::Rng;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Time unit scaled by `base^attempt`.
    pub unit: Duration,
    /// Exponential base.
    pub base: u32,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Jitter factor as a fraction (e.g., 0.1 = ±10% randomization).
    pub jitter_factor: f64,
    /// Consecutive failures tolerated before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            unit: Duration::from_secs(1),
            base: 2,
            max_delay: Duration::from_secs(300),
            jitter_factor: 0.0,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    /// Delay before the next attempt after `attempt` consecutive failures,
    /// without jitter.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.base.checked_pow(attempt).unwrap_or(u32::MAX);
        self.unit
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Reconnection policy tracking consecutive failures.
///
/// # Example
///
/// ```rust
/// use position_monitor::domain::connection::{ReconnectConfig, ReconnectPolicy};
/// use std::time::Duration;
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
///
/// assert_eq!(policy.next_delay(), Some(Duration::from_secs(2)));
/// assert_eq!(policy.next_delay(), Some(Duration::from_secs(4)));
///
/// // Successful connection
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
        }
    }

    /// Record a failed attempt and return how long to wait before the next.
    ///
    /// Returns `None` once `max_attempts` consecutive failures have been
    /// recorded.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt_count = self.attempt_count.saturating_add(1);

        if !self.should_retry() {
            return None;
        }

        Some(self.apply_jitter(self.config.delay_for_attempt(self.attempt_count)))
    }

    /// Reset the policy after a successful connection.
    pub const fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Consecutive failures recorded so far.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Check if reconnection should continue.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let mut rng = rand::rng();
        let jitter: f64 = rng.random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}
