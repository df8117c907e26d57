//! Per-model interval gate.
//!
//! Each model key admits at most one call per minimum interval
//! (`1 / rateLimit` seconds). There is no queueing and no burst credit: a
//! call that arrives too early is denied immediately, however long the model
//! was idle before the previous admission.
//!
//! The read-compare-write on a key happens while holding the map's entry
//! guard for that key, so concurrent callers for the same model serialize on
//! the shard lock and at most one of them can observe an expired interval.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied {
        /// Time left until the key can be admitted again
        retry_after: Duration,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

/// Interval gate keyed by model name.
#[derive(Debug, Default)]
pub struct RateLimiter {
    /// Last admitted instant per model key
    last_admitted: DashMap<String, Instant>,
    admitted: AtomicU64,
    denied: AtomicU64,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit or deny a call for `model_key` at `now`.
    ///
    /// On `Allowed` the key's timestamp is set to `now` in the same step.
    /// On `Denied` nothing is recorded.
    pub fn admit(&self, model_key: &str, min_interval: Duration, now: Instant) -> Admission {
        let admission = match self.last_admitted.entry(model_key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(now);
                Admission::Allowed
            }
            Entry::Occupied(mut slot) => {
                let elapsed = now.saturating_duration_since(*slot.get());
                if elapsed >= min_interval {
                    slot.insert(now);
                    Admission::Allowed
                } else {
                    Admission::Denied {
                        retry_after: min_interval - elapsed,
                    }
                }
            }
        };

        match admission {
            Admission::Allowed => {
                self.admitted.fetch_add(1, Ordering::Relaxed);
            }
            Admission::Denied { retry_after } => {
                self.denied.fetch_add(1, Ordering::Relaxed);
                debug!(
                    model = model_key,
                    retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                    "Rate limit denied call"
                );
            }
        }
        admission
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            models_tracked: self.last_admitted.len(),
        }
    }
}

/// Rate limiter statistics.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub admitted: u64,
    pub denied: u64,
    pub models_tracked: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    const ONE_SEC: Duration = Duration::from_secs(1);

    #[test]
    fn first_call_is_allowed() {
        let limiter = RateLimiter::new();
        assert_eq!(
            limiter.admit("gpt-4", ONE_SEC, Instant::now()),
            Admission::Allowed
        );
    }

    #[test]
    fn call_inside_interval_is_denied() {
        let limiter = RateLimiter::new();
        let t0 = Instant::now();

        assert!(limiter.admit("gpt-4", ONE_SEC, t0).is_allowed());
        let second = limiter.admit("gpt-4", ONE_SEC, t0 + Duration::from_millis(100));

        assert_eq!(
            second,
            Admission::Denied {
                retry_after: Duration::from_millis(900)
            }
        );
    }

    #[test]
    fn call_at_or_after_interval_is_allowed() {
        let limiter = RateLimiter::new();
        let t0 = Instant::now();

        assert!(limiter.admit("m", ONE_SEC, t0).is_allowed());
        assert!(limiter.admit("m", ONE_SEC, t0 + ONE_SEC).is_allowed());
        assert!(limiter
            .admit("m", ONE_SEC, t0 + ONE_SEC + Duration::from_secs(5))
            .is_allowed());
    }

    #[test]
    fn denial_does_not_move_the_window() {
        let limiter = RateLimiter::new();
        let t0 = Instant::now();
        let interval = Duration::from_millis(500);

        assert!(limiter.admit("m", interval, t0).is_allowed());
        assert!(!limiter
            .admit("m", interval, t0 + Duration::from_millis(400))
            .is_allowed());
        // Measured from t0, not from the denied attempt.
        assert!(limiter
            .admit("m", interval, t0 + Duration::from_millis(500))
            .is_allowed());
    }

    #[test]
    fn idle_time_does_not_build_burst_credit() {
        let limiter = RateLimiter::new();
        let t0 = Instant::now();

        assert!(limiter.admit("m", ONE_SEC, t0).is_allowed());
        let later = t0 + Duration::from_secs(3600);
        assert!(limiter.admit("m", ONE_SEC, later).is_allowed());
        assert!(!limiter
            .admit("m", ONE_SEC, later + Duration::from_millis(1))
            .is_allowed());
    }

    #[test]
    fn saturated_interval_denies_without_overflow() {
        let limiter = RateLimiter::new();
        let t0 = Instant::now();

        assert!(limiter.admit("slow", Duration::MAX, t0).is_allowed());
        match limiter.admit("slow", Duration::MAX, t0 + Duration::from_secs(86_400)) {
            Admission::Denied { retry_after } => {
                assert_eq!(retry_after, Duration::MAX - Duration::from_secs(86_400));
            }
            Admission::Allowed => panic!("expected denial"),
        }
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new();
        let t0 = Instant::now();

        assert!(limiter.admit("a", ONE_SEC, t0).is_allowed());
        assert!(limiter.admit("b", ONE_SEC, t0).is_allowed());
        assert!(!limiter.admit("a", ONE_SEC, t0).is_allowed());
    }

    #[test]
    fn at_most_one_of_simultaneous_calls_is_admitted() {
        let limiter = RateLimiter::new();
        let threads = 16;
        let barrier = Barrier::new(threads);
        let now = Instant::now();

        let allowed = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        limiter.admit("shared", Duration::from_secs(60), now)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(Admission::is_allowed)
                .count()
        });

        assert_eq!(allowed, 1);
        let stats = limiter.stats();
        assert_eq!(stats.admitted, 1);
        assert_eq!(stats.denied, (threads - 1) as u64);
        assert_eq!(stats.models_tracked, 1);
    }
}
