//! Retry policy for store handle acquisition.

use crate::config::DatabaseConfig;
use backoff::backoff::Backoff;
use std::time::Duration;

/// Probe timeout used when none is configured
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounded retry with linearly increasing backoff.
///
/// Attempts are numbered from 1. The delay after a failed attempt `n` is
/// `base_delay * n`, so with a base of 500ms a three-attempt policy sleeps
/// 500ms, then 1s, and gives up after the third failure without sleeping.
/// Each attempt's open and probe are bounded by `probe_timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    probe_timeout: Duration,
}

impl RetryPolicy {
    /// Create a policy. A zero attempt count is raised to one.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Bound each open-and-probe attempt by `timeout`
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Total attempts, including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff base
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    /// Fresh delay schedule for one acquisition
    pub fn backoff(&self) -> LinearBackoff {
        LinearBackoff {
            base_delay: self.base_delay,
            max_attempts: self.max_attempts,
            failed: 0,
        }
    }

    /// Sum of every delay slept when all attempts fail
    pub fn worst_case_delay(&self) -> Duration {
        let mut backoff = self.backoff();
        std::iter::from_fn(|| backoff.next_backoff()).sum()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}

impl From<&DatabaseConfig> for RetryPolicy {
    fn from(config: &DatabaseConfig) -> Self {
        Self::new(config.max_retries, config.retry_base_delay())
            .with_probe_timeout(config.connect_timeout())
    }
}

/// Linear delay schedule that runs out after the last attempt.
///
/// Each call to `next_backoff` accounts for one failed attempt and returns the
/// wait before the next one, or `None` once no attempts remain.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    base_delay: Duration,
    max_attempts: u32,
    failed: u32,
}

impl LinearBackoff {
    /// Failed attempts seen so far
    pub fn failed_attempts(&self) -> u32 {
        self.failed
    }
}

impl Backoff for LinearBackoff {
    fn reset(&mut self) {
        self.failed = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.failed = self.failed.saturating_add(1);
        if self.failed < self.max_attempts {
            Some(self.base_delay.saturating_mul(self.failed))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_backoff() {
        let mut backoff = RetryPolicy::new(4, Duration::from_millis(100)).backoff();

        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(300)));
        assert_eq!(backoff.next_backoff(), None);
        assert_eq!(backoff.failed_attempts(), 4);
    }

    #[test]
    fn test_attempt_bound() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        let mut backoff = policy.backoff();

        assert!(backoff.next_backoff().is_some());
        assert!(backoff.next_backoff().is_some());
        assert!(backoff.next_backoff().is_none());
        assert_eq!(policy.worst_case_delay(), Duration::from_millis(300));
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let mut backoff = RetryPolicy::new(2, Duration::from_millis(50)).backoff();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(50)));
        assert_eq!(backoff.next_backoff(), None);

        backoff.reset();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn test_zero_attempts_clamped() {
        let policy = RetryPolicy::new(0, Duration::ZERO);
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.backoff().next_backoff(), None);
        assert_eq!(policy.worst_case_delay(), Duration::ZERO);
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.base_delay(), Duration::from_millis(500));
        assert_eq!(policy.probe_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_probe_timeout_from_connect_timeout() {
        let config = DatabaseConfig {
            url: "postgresql://localhost/clips".to_string(),
            max_connections: 5,
            min_connections: 0,
            connect_timeout_secs: 2,
            idle_timeout_secs: 300,
            run_migrations: false,
            max_retries: 4,
            retry_base_delay_ms: 250,
        };

        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.base_delay(), Duration::from_millis(250));
        assert_eq!(policy.probe_timeout(), Duration::from_secs(2));
    }
}
