//! Client reconnection policy

use std::time::Duration;

/// Default delay before the first retry
pub const BASE_RECONNECT_DELAY_MS: u64 = 1000;

/// Largest exponent applied to the base delay (1s * 2^5 = 32s)
pub const MAX_BACKOFF_EXPONENT: u32 = 5;

/// Upper bound of the random jitter, as a fraction of the computed delay
pub const JITTER_RATIO: f64 = 0.1;

/// Attempts before the client gives up
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Connection state of a reconnecting client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Exponential backoff with capped exponent and additive jitter
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_exponent: u32,
    pub jitter_ratio: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(BASE_RECONNECT_DELAY_MS),
            max_exponent: MAX_BACKOFF_EXPONENT,
            jitter_ratio: JITTER_RATIO,
            max_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (0-based), without jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(self.max_exponent);
        self.base_delay
            .saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX))
    }

    /// Delay before retry number `attempt` (0-based), with up to `jitter_ratio` extra
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        let jitter = backoff.mul_f64(self.jitter_ratio * fastrand::f64());
        backoff + jitter
    }

    /// Whether another attempt is allowed after `attempts_made` failures
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (0..8).map(|a| policy.backoff(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 32000, 32000, 32000]);
    }

    #[test]
    fn test_large_exponent_saturates() {
        let policy = ReconnectPolicy {
            max_exponent: 40,
            ..ReconnectPolicy::default()
        };
        assert_eq!(policy.backoff(31), Duration::from_millis(1000 * (1u64 << 31)));
        assert_eq!(policy.backoff(32), Duration::from_millis(1000 * u32::MAX as u64));
        assert_eq!(policy.backoff(u32::MAX), policy.backoff(32));
    }

    #[test]
    fn test_jitter_bounded() {
        let policy = ReconnectPolicy::default();
        for attempt in 0..12 {
            let base = policy.backoff(attempt);
            for _ in 0..50 {
                let delay = policy.delay_for(attempt);
                assert!(delay >= base);
                assert!(delay <= base + base.mul_f64(JITTER_RATIO));
            }
        }
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let policy = ReconnectPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(9));
        assert!(!policy.should_retry(10));
    }

    #[test]
    fn test_connection_state_equality() {
        assert_eq!(ConnectionState::Connected, ConnectionState::Connected);
        assert_ne!(ConnectionState::Connecting, ConnectionState::Disconnected);
    }
}
