//! Infer rate/health limiter.
//!
//! A token bucket caps the request rate; a rolling window of upstream
//! outcomes trips the limiter when the backend is mostly failing.

use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::Mutex;
use serde::Serialize;

use mc_domain::config::LimiterConfig;

/// Outcome counts inside the current window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WindowStats {
    pub success: usize,
    pub failure: usize,
}

pub struct InferLimiter {
    bucket: DefaultDirectRateLimiter,
    outcomes: Mutex<VecDeque<(Instant, bool)>>,
    window: Duration,
    min_failures: usize,
    max_failure_ratio: f64,
}

impl InferLimiter {
    pub fn new(cfg: &LimiterConfig) -> Self {
        let rate = NonZeroU32::new(cfg.rate_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(cfg.burst).unwrap_or(rate);
        Self {
            bucket: RateLimiter::direct(Quota::per_second(rate).allow_burst(burst)),
            outcomes: Mutex::new(VecDeque::new()),
            window: Duration::from_secs(cfg.window_secs),
            min_failures: cfg.min_failures,
            max_failure_ratio: cfg.max_failure_ratio,
        }
    }

    /// Record one completed upstream call.
    pub fn add_stats(&self, success: bool) {
        self.add_stats_at(success, Instant::now());
    }

    pub(crate) fn add_stats_at(&self, success: bool, at: Instant) {
        self.outcomes.lock().push_back((at, success));
    }

    /// Whether a new inference may start. Consumes a token when allowed.
    pub fn allow(&self) -> bool {
        let stats = self.stats();
        let total = stats.success + stats.failure;
        if stats.failure > self.min_failures
            && total > 0
            && stats.failure as f64 / total as f64 > self.max_failure_ratio
        {
            tracing::warn!(
                success = stats.success,
                failure = stats.failure,
                "infer limiter tripped by upstream failures"
            );
            return false;
        }
        if self.bucket.check().is_err() {
            tracing::warn!("infer limiter denied by token bucket");
            return false;
        }
        true
    }

    /// Evict stale outcomes and count the rest.
    pub fn stats(&self) -> WindowStats {
        let now = Instant::now();
        let mut outcomes = self.outcomes.lock();
        while let Some((at, _)) = outcomes.front() {
            if now.saturating_duration_since(*at) > self.window {
                outcomes.pop_front();
            } else {
                break;
            }
        }
        let success = outcomes.iter().filter(|(_, ok)| *ok).count();
        WindowStats {
            success,
            failure: outcomes.len() - success,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> InferLimiter {
        InferLimiter::new(&LimiterConfig::default())
    }

    #[test]
    fn healthy_backend_is_allowed() {
        let l = limiter();
        for _ in 0..20 {
            l.add_stats(true);
        }
        l.add_stats(false);
        assert!(l.allow());
    }

    #[test]
    fn mostly_failing_backend_trips() {
        let l = limiter();
        for _ in 0..5 {
            l.add_stats(true);
        }
        for _ in 0..11 {
            l.add_stats(false);
        }
        assert_eq!(l.stats(), WindowStats { success: 5, failure: 11 });
        assert!(!l.allow());
    }

    #[test]
    fn ten_failures_are_tolerated() {
        let l = limiter();
        for _ in 0..10 {
            l.add_stats(false);
        }
        assert!(l.allow());
    }

    #[test]
    fn old_failures_fall_out_of_the_window() {
        let l = limiter();
        let Some(old) = Instant::now().checked_sub(Duration::from_secs(31)) else {
            return;
        };
        for _ in 0..11 {
            l.add_stats_at(false, old);
        }
        assert_eq!(l.stats(), WindowStats::default());
        assert!(l.allow());
    }

    #[test]
    fn bucket_denies_past_burst() {
        let l = InferLimiter::new(&LimiterConfig {
            rate_per_second: 1,
            burst: 2,
            ..LimiterConfig::default()
        });
        assert!(l.allow());
        assert!(l.allow());
        assert!(!l.allow());
    }
}
