//! Fixed-window auth-failure limiter for the auxiliary hook endpoints.
//!
//! Counts failures per client key: 20 per 60-second window, tracking at
//! most 2048 keys. When the table fills, expired entries are pruned first;
//! if it is still full, the oldest half is dropped. A successful auth
//! clears the caller's counter. Throttled callers get a 429 with a
//! `Retry-After` in seconds.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const MAX_FAILURES: u32 = 20;
pub const WINDOW: Duration = Duration::from_secs(60);
pub const MAX_TRACKED_KEYS: usize = 2048;

#[derive(Debug, Clone)]
struct FailureWindow {
    failures: u32,
    window_start: Instant,
}

#[derive(Default)]
pub struct HookRateLimiter {
    entries: Mutex<HashMap<String, FailureWindow>>,
}

/// Verdict for one request attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateVerdict {
    Allowed,
    /// Caller must back off; retry after this many seconds.
    Throttled { retry_after_secs: u64 },
}

impl HookRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether `key` may attempt auth right now.
    pub fn check(&self, key: &str) -> RateVerdict {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(key) else {
            return RateVerdict::Allowed;
        };
        if entry.window_start.elapsed() >= WINDOW {
            entries.remove(key);
            return RateVerdict::Allowed;
        }
        if entry.failures >= MAX_FAILURES {
            let elapsed = entry.window_start.elapsed();
            let remaining = WINDOW.saturating_sub(elapsed);
            let retry_after_secs = remaining.as_secs().max(1);
            debug!(key, retry_after_secs, "hook caller throttled");
            return RateVerdict::Throttled { retry_after_secs };
        }
        RateVerdict::Allowed
    }

    /// Record a failed auth attempt.
    pub fn record_failure(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap();

        if entries.len() >= MAX_TRACKED_KEYS && !entries.contains_key(key) {
            // Prune expired windows first.
            entries.retain(|_, entry| entry.window_start.elapsed() < WINDOW);
            if entries.len() >= MAX_TRACKED_KEYS {
                // Still full: drop the oldest half.
                let mut by_age: Vec<(String, Instant)> = entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.window_start))
                    .collect();
                by_age.sort_by_key(|(_, start)| *start);
                let drop_count = by_age.len() / 2;
                for (key, _) in by_age.into_iter().take(drop_count) {
                    entries.remove(&key);
                }
                warn!(dropped = drop_count, "hook limiter table overflow, dropped oldest half");
            }
        }

        let now = Instant::now();
        let entry = entries.entry(key.to_string()).or_insert(FailureWindow {
            failures: 0,
            window_start: now,
        });
        if entry.window_start.elapsed() >= WINDOW {
            entry.failures = 0;
            entry.window_start = now;
        }
        entry.failures += 1;
    }

    /// Successful auth clears the caller's counter.
    pub fn record_success(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttles_after_twenty_failures() {
        let limiter = HookRateLimiter::new();
        for i in 0..MAX_FAILURES {
            assert_eq!(limiter.check("1.2.3.4"), RateVerdict::Allowed, "attempt {}", i);
            limiter.record_failure("1.2.3.4");
        }
        // The 21st attempt is refused with Retry-After >= 1.
        match limiter.check("1.2.3.4") {
            RateVerdict::Throttled { retry_after_secs } => assert!(retry_after_secs >= 1),
            RateVerdict::Allowed => panic!("21st attempt must be throttled"),
        }
    }

    #[test]
    fn success_clears_counter() {
        let limiter = HookRateLimiter::new();
        for _ in 0..MAX_FAILURES {
            limiter.record_failure("1.2.3.4");
        }
        assert!(matches!(
            limiter.check("1.2.3.4"),
            RateVerdict::Throttled { .. }
        ));
        limiter.record_success("1.2.3.4");
        assert_eq!(limiter.check("1.2.3.4"), RateVerdict::Allowed);
    }

    #[test]
    fn keys_are_tracked_independently() {
        let limiter = HookRateLimiter::new();
        for _ in 0..MAX_FAILURES {
            limiter.record_failure("attacker");
        }
        assert!(matches!(
            limiter.check("attacker"),
            RateVerdict::Throttled { .. }
        ));
        assert_eq!(limiter.check("legit"), RateVerdict::Allowed);
    }

    #[test]
    fn overflow_drops_oldest_half() {
        let limiter = HookRateLimiter::new();
        for i in 0..MAX_TRACKED_KEYS {
            limiter.record_failure(&format!("key-{}", i));
        }
        assert_eq!(limiter.tracked(), MAX_TRACKED_KEYS);
        // Nothing expired, so inserting one more halves the table.
        limiter.record_failure("one-more");
        assert!(limiter.tracked() <= MAX_TRACKED_KEYS / 2 + 1);
    }
}
