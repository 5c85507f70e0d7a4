//! Stream Liveness
//!
//! Tracks the time since the stream last delivered anything (ticks, account
//! events, pongs) and classifies the silence against the heartbeat timeout
//! and the degraded grace period.

use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Configuration for heartbeat checks.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// How often liveness is checked.
    pub check_interval: Duration,
    /// Silence after which the session is degraded.
    pub timeout: Duration,
    /// Further silence tolerated while degraded before disconnecting.
    pub grace: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(60),
            grace: Duration::from_secs(30),
        }
    }
}

/// Classification of the current silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Traffic within the timeout.
    Healthy,
    /// Silent past the timeout, still within the grace period.
    Stale,
    /// Silent past timeout plus grace.
    Dead,
}

impl HeartbeatConfig {
    /// Classify a silence of `silent_for`.
    #[must_use]
    pub fn assess(&self, silent_for: Duration) -> Liveness {
        if silent_for <= self.timeout {
            Liveness::Healthy
        } else if silent_for <= self.timeout + self.grace {
            Liveness::Stale
        } else {
            Liveness::Dead
        }
    }
}

/// Last-activity timestamp shared between the event router and the
/// supervisor.
#[derive(Debug)]
pub struct HeartbeatState {
    last_activity: RwLock<Instant>,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Create new heartbeat state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_activity: RwLock::new(Instant::now()),
        }
    }

    /// Record inbound traffic.
    pub fn record_activity(&self) {
        *self.last_activity.write() = Instant::now();
    }

    /// Time since the last inbound traffic.
    #[must_use]
    pub fn time_since_activity(&self) -> Duration {
        self.last_activity.read().elapsed()
    }

    /// Reset state for a new session.
    pub fn reset(&self) {
        self.record_activity();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assess_thresholds() {
        let config = HeartbeatConfig {
            check_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(60),
            grace: Duration::from_secs(30),
        };

        assert_eq!(config.assess(Duration::from_secs(10)), Liveness::Healthy);
        assert_eq!(config.assess(Duration::from_secs(60)), Liveness::Healthy);
        assert_eq!(config.assess(Duration::from_secs(61)), Liveness::Stale);
        assert_eq!(config.assess(Duration::from_secs(90)), Liveness::Stale);
        assert_eq!(config.assess(Duration::from_secs(91)), Liveness::Dead);
    }

    #[test]
    fn activity_resets_silence() {
        let state = HeartbeatState::new();
        std::thread::sleep(Duration::from_millis(20));
        assert!(state.time_since_activity() >= Duration::from_millis(20));

        state.record_activity();
        assert!(state.time_since_activity() < Duration::from_millis(20));
    }
}
