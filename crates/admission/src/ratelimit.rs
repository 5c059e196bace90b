//! Fixed-window rate limits.
//!
//! Each key gets `limit` increments per window. The window starts on the
//! first increment and is reset lazily by the first increment after it ends,
//! so a whole window's budget can be spent at once. Remaining keeps going
//! below zero once exhausted; the deficit is reported in the error.

use std::collections::HashMap;
use std::sync::Mutex;

use launchpad_core::{AdmissionError, LaunchResult};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const DEFAULT_PERIOD_SECONDS: i64 = 3600;
pub const DEFAULT_LIMIT: i64 = 10;
pub const DEFAULT_CLEAN_SECONDS: i64 = 600;

/// State of one key's window, as returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub limit: i64,
    pub remaining: i64,
    /// Unix timestamp at which the window ends.
    pub reset: i64,
    pub reset_in: i64,
}

#[derive(Debug, Clone, Copy)]
struct Record {
    limit: i64,
    remaining: i64,
    reset: i64,
}

#[derive(Default)]
struct State {
    limits: HashMap<String, Record>,
    last_cleaned: Option<i64>,
}

/// Anything that can count an attempt against a key: the in-process
/// [`RateLimiter`] or a shared endpoint via [`crate::RemoteRateLimiter`].
#[async_trait::async_trait]
pub trait RateLimit: Send + Sync {
    /// Exceeding the limit is `LaunchError::Admission(RateLimited)`.
    async fn increment(&self, key: &str) -> LaunchResult<RateLimitStatus>;
}

pub struct RateLimiter {
    limit: i64,
    period_seconds: i64,
    clean_seconds: i64,
    state: Mutex<State>,
}

impl Default for RateLimiter {
    fn default() -> Self { Self::new(DEFAULT_LIMIT, DEFAULT_PERIOD_SECONDS, DEFAULT_CLEAN_SECONDS) }
}

impl RateLimiter {
    pub fn new(limit: i64, period_seconds: i64, clean_seconds: i64) -> Self {
        Self { limit, period_seconds, clean_seconds, state: Mutex::new(State::default()) }
    }

    pub fn limit(&self) -> i64 { self.limit }

    pub fn period_seconds(&self) -> i64 { self.period_seconds }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize { self.state.lock().unwrap_or_else(|p| p.into_inner()).limits.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn increment_now(&self, key: &str, initial_limit: Option<i64>) -> Result<RateLimitStatus, AdmissionError> {
        self.increment_at(key, initial_limit, chrono::Utc::now().timestamp())
    }

    /// Count one attempt for `key` at unix time `now`. `initial_limit`
    /// overrides the configured limit when a new window starts.
    pub fn increment_at(&self, key: &str, initial_limit: Option<i64>, now: i64) -> Result<RateLimitStatus, AdmissionError> {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let last_cleaned = *st.last_cleaned.get_or_insert(now);
        if now - last_cleaned > self.clean_seconds {
            let before = st.limits.len();
            st.limits.retain(|_, r| r.reset > now);
            st.last_cleaned = Some(now);
            debug!(removed = before - st.limits.len(), "cleaned expired rate limits");
        }
        let fresh = Record { limit: initial_limit.unwrap_or(self.limit), remaining: initial_limit.unwrap_or(self.limit), reset: now + self.period_seconds };
        let rec = st.limits.entry(key.to_string()).or_insert(fresh);
        if rec.reset < now {
            *rec = fresh;
        }
        rec.remaining -= 1;
        let status = RateLimitStatus { limit: rec.limit, remaining: rec.remaining, reset: rec.reset, reset_in: rec.reset - now };
        if status.remaining < 0 {
            counter!("ratelimit_exceeded", 1);
            warn!(key, deficit = -status.remaining, reset_in = status.reset_in, "rate limit exceeded");
            return Err(AdmissionError::RateLimited {
                key: key.to_string(),
                limit: status.limit,
                deficit: -status.remaining,
                reset_in: status.reset_in,
            });
        }
        Ok(status)
    }
}

#[async_trait::async_trait]
impl RateLimit for RateLimiter {
    async fn increment(&self, key: &str) -> LaunchResult<RateLimitStatus> { Ok(self.increment_now(key, None)?) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_down_then_reports_deficit() {
        let rl = RateLimiter::new(3, 100, 600);
        for n in 1..=3 {
            let s = rl.increment_at("k", None, 1000).unwrap();
            assert_eq!(s.remaining, 3 - n);
            assert_eq!(s.reset, 1100);
        }
        for deficit in 1..=2 {
            match rl.increment_at("k", None, 1010).unwrap_err() {
                AdmissionError::RateLimited { deficit: d, reset_in, limit, .. } => {
                    assert_eq!(d, deficit);
                    assert_eq!(reset_in, 90);
                    assert_eq!(limit, 3);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn window_resets_lazily_after_expiry() {
        let rl = RateLimiter::new(2, 100, 600);
        rl.increment_at("k", None, 0).unwrap();
        rl.increment_at("k", None, 0).unwrap();
        assert!(rl.increment_at("k", None, 100).is_err());
        let s = rl.increment_at("k", None, 101).unwrap();
        assert_eq!(s.remaining, 1);
        assert_eq!(s.reset, 201);
    }

    #[test]
    fn keys_are_independent() {
        let rl = RateLimiter::new(1, 100, 600);
        rl.increment_at("a", None, 0).unwrap();
        assert!(rl.increment_at("a", None, 0).is_err());
        assert!(rl.increment_at("b", None, 0).is_ok());
    }

    #[test]
    fn initial_limit_applies_to_new_windows() {
        let rl = RateLimiter::new(10, 100, 600);
        let s = rl.increment_at("k", Some(2), 0).unwrap();
        assert_eq!((s.limit, s.remaining), (2, 1));
        let s = rl.increment_at("k", Some(50), 1).unwrap();
        assert_eq!((s.limit, s.remaining), (2, 0));
    }

    #[test]
    fn sweep_drops_expired_windows() {
        let rl = RateLimiter::new(5, 10, 60);
        rl.increment_at("old", None, 0).unwrap();
        rl.increment_at("new", None, 55).unwrap();
        assert_eq!(rl.len(), 2);
        // 61s since the first call: sweep runs, "old" ended at 10.
        rl.increment_at("new", None, 61).unwrap();
        assert_eq!(rl.len(), 1);
    }
}
