use crate::config::{RateLimitConfig, RateLimitRuleConfig};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Identity shared by every client whose address cannot be resolved
pub const UNKNOWN_CLIENT: &str = "unknown";

/// A named sliding-window limit applied to a group of operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRule {
    /// Windows are tracked separately per scope
    pub scope: &'static str,
    /// Requests admitted inside one window
    pub max_requests: u32,
    /// Trailing window length
    pub window: Duration,
}

impl RateLimitRule {
    pub fn new(scope: &'static str, max_requests: u32, window: Duration) -> Self {
        Self {
            scope,
            max_requests,
            window,
        }
    }

    pub fn from_config(scope: &'static str, config: &RateLimitRuleConfig) -> Self {
        Self::new(scope, config.max_requests, config.window())
    }
}

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// The request was admitted and recorded
    Admitted,
    /// The window is full; the oldest entry expires after `retry_after`
    Rejected { retry_after: Duration },
}

impl RateDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, RateDecision::Admitted)
    }
}

/// Timestamps of admitted requests for one client in one scope
#[derive(Debug)]
struct RequestWindow {
    window: Duration,
    hits: VecDeque<Instant>,
}

impl RequestWindow {
    fn new(window: Duration) -> Self {
        Self {
            window,
            hits: VecDeque::new(),
        }
    }

    /// Drop every hit at least one window old. Hits are in admission order.
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.hits.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Per-client sliding-window rate limiter
///
/// Counts admitted requests inside a trailing window and rejects once the
/// count reaches the limit. Bursts are bounded strictly by count, not
/// smoothed. All windows sit behind one mutex; the critical section is a
/// prune plus a push and never spans an await.
pub struct RateLimiter {
    windows: Mutex<HashMap<(&'static str, String), RequestWindow>>,
    /// Checks between sweeps of empty windows (0 disables sweeping)
    sweep_interval: u64,
    checks: AtomicU64,
}

impl RateLimiter {
    /// Create a limiter that sweeps idle windows every `sweep_interval` checks
    pub fn new(sweep_interval: u64) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            sweep_interval,
            checks: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.sweep_interval)
    }

    /// Admit or reject a request from `identity` at `now`, recording it if admitted
    pub fn check_and_record(
        &self,
        identity: &str,
        rule: &RateLimitRule,
        now: Instant,
    ) -> RateDecision {
        let identity = if identity.is_empty() {
            UNKNOWN_CLIENT
        } else {
            identity
        };

        let decision = {
            let mut windows = self.windows.lock();
            let entry = windows
                .entry((rule.scope, identity.to_string()))
                .or_insert_with(|| RequestWindow::new(rule.window));
            entry.window = rule.window;
            entry.prune(now);

            if entry.hits.len() >= rule.max_requests as usize {
                let retry_after = entry
                    .hits
                    .front()
                    .map(|&oldest| {
                        rule.window
                            .saturating_sub(now.saturating_duration_since(oldest))
                    })
                    .unwrap_or(rule.window);
                RateDecision::Rejected { retry_after }
            } else {
                entry.hits.push_back(now);
                RateDecision::Admitted
            }
        };

        match decision {
            RateDecision::Admitted => {
                trace!(client = %identity, scope = rule.scope, "Request admitted");
            }
            RateDecision::Rejected { retry_after } => {
                debug!(
                    client = %identity,
                    scope = rule.scope,
                    max_requests = rule.max_requests,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Request rejected by rate limiter"
                );
                metrics::counter!("clips_rate_limit_rejections_total", "scope" => rule.scope)
                    .increment(1);
            }
        }

        let checks = self.checks.fetch_add(1, Ordering::Relaxed) + 1;
        if self.sweep_interval > 0 && checks % self.sweep_interval == 0 {
            self.sweep(now);
        }

        decision
    }

    /// Evict windows with no hits left inside their window
    pub fn sweep(&self, now: Instant) -> usize {
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, window| {
            window.prune(now);
            !window.hits.is_empty()
        });
        let evicted = before - windows.len();
        if evicted > 0 {
            debug!(evicted = evicted, remaining = windows.len(), "Swept idle rate limit windows");
        }
        evicted
    }

    /// Number of tracked client windows
    pub fn tracked_clients(&self) -> usize {
        self.windows.lock().len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(1024)
    }
}
