//! Rate limiting for preventing database overload
//!
//! Requests are counted per identifier (typically a client IP) in fixed buckets of
//! width `window`, keyed by `floor(now / window)`.
//!
//! This approximates a sliding window. A client that spends its whole budget at the
//! end of one bucket and again at the start of the next gets up to
//! `2 × max_requests` through within a single `window`-length span. Callers that
//! need a strict bound must use a smaller window.
//!
//! Counters live in process memory only: limits are not shared between server
//! instances and are lost on restart. Expired buckets are swept periodically so
//! that memory stays bounded by the number of identifiers active per window.

use crate::error::ResilienceError;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Per-call limit parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitOptions {
    /// Bucket width
    pub window: Duration,
    /// Maximum requests allowed per bucket
    pub max_requests: u32,
}

impl RateLimitOptions {
    /// Create options allowing `max_requests` per `window`
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            window,
            max_requests,
        }
    }

    /// Create options with requests per second
    pub fn per_second(requests_per_second: u32) -> Self {
        Self::new(requests_per_second, Duration::from_secs(1))
    }

    /// Create options with requests per minute
    pub fn per_minute(requests_per_minute: u32) -> Self {
        Self::new(requests_per_minute, Duration::from_secs(60))
    }
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self::per_minute(100)
    }
}

/// Outcome of a single limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// The configured `max_requests`
    pub limit: u32,
    pub remaining: u32,
    /// Unix time in milliseconds at which the current bucket ends
    pub reset_time_ms: u64,
}

impl RateLimitDecision {
    /// Time left until the bucket resets, measured from `now_ms`
    pub fn retry_after(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.reset_time_ms.saturating_sub(now_ms))
    }
}

/// Memory bounds for the limiter
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Sweep expired buckets after this many checks
    pub sweep_interval: u64,
    /// Sweep immediately once this many buckets are tracked. When a sweep leaves the
    /// table above this size, the next size-triggered sweep waits until it doubles.
    pub max_tracked_keys: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            sweep_interval: 1_000,
            max_tracked_keys: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    identifier: String,
    window_index: u64,
}

#[derive(Debug)]
struct WindowEntry {
    count: u32,
    reset_time_ms: u64,
}

#[derive(Debug, Default)]
struct LimiterState {
    windows: HashMap<WindowKey, WindowEntry>,
    checks_since_sweep: u64,
    /// Table size that forces the next sweep, on top of `max_tracked_keys`
    size_trigger: usize,
}

impl LimiterState {
    fn sweep(&mut self, now_ms: u64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, entry| entry.reset_time_ms > now_ms);
        self.checks_since_sweep = 0;
        self.size_trigger = self.windows.len().saturating_mul(2);
        before - self.windows.len()
    }
}

/// Keyed fixed-window rate limiter
///
/// # Example
/// ```
/// use bulwark_core_resilience::{RateLimiter, RateLimitOptions};
///
/// let limiter = RateLimiter::default();
/// let options = RateLimitOptions::per_minute(100);
///
/// let decision = limiter.check_limit("1.2.3.4", &options).unwrap();
/// assert!(decision.allowed);
/// assert_eq!(decision.remaining, 99);
/// ```
#[derive(Debug, Default)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LimiterState::default()),
        }
    }

    /// Count a request for `identifier` against the current bucket
    pub fn check_limit(
        &self,
        identifier: &str,
        options: &RateLimitOptions,
    ) -> Result<RateLimitDecision, ResilienceError> {
        self.check_limit_at(identifier, options, unix_millis())
    }

    /// Same as [`check_limit`](Self::check_limit) with an explicit clock reading
    pub fn check_limit_at(
        &self,
        identifier: &str,
        options: &RateLimitOptions,
        now_ms: u64,
    ) -> Result<RateLimitDecision, ResilienceError> {
        let window_ms = u64::try_from(options.window.as_millis()).unwrap_or(u64::MAX);
        if window_ms == 0 {
            return Err(ResilienceError::InvalidConfig(
                "rate limit window must be non-zero".to_string(),
            ));
        }
        if options.max_requests == 0 {
            return Err(ResilienceError::InvalidConfig(
                "rate limit max_requests must be > 0".to_string(),
            ));
        }

        let window_index = now_ms / window_ms;
        let reset_time_ms = window_index.saturating_add(1).saturating_mul(window_ms);

        let mut state = self
            .state
            .lock()
            .map_err(|_| ResilienceError::Internal("rate limiter state poisoned".to_string()))?;

        state.checks_since_sweep += 1;
        let size_trigger = self.config.max_tracked_keys.max(state.size_trigger);
        if state.checks_since_sweep >= self.config.sweep_interval
            || state.windows.len() >= size_trigger
        {
            let removed = state.sweep(now_ms);
            debug!(removed, tracked = state.windows.len(), "Swept expired rate limit windows");
            if state.windows.len() >= self.config.max_tracked_keys {
                warn!(
                    tracked = state.windows.len(),
                    max = self.config.max_tracked_keys,
                    "Rate limiter tracking more active keys than configured"
                );
            }
        }

        let key = WindowKey {
            identifier: identifier.to_string(),
            window_index,
        };
        let entry = state.windows.entry(key).or_insert(WindowEntry {
            count: 0,
            reset_time_ms,
        });

        if entry.count >= options.max_requests {
            return Ok(RateLimitDecision {
                allowed: false,
                limit: options.max_requests,
                remaining: 0,
                reset_time_ms: entry.reset_time_ms,
            });
        }

        entry.count += 1;
        Ok(RateLimitDecision {
            allowed: true,
            limit: options.max_requests,
            remaining: options.max_requests - entry.count,
            reset_time_ms: entry.reset_time_ms,
        })
    }

    /// Clear every bucket belonging to `identifier`; returns how many were removed
    ///
    /// Matches the identifier exactly, so resetting `1.2.3.4` leaves `1.2.3.45` alone.
    pub fn reset_limit(&self, identifier: &str) -> usize {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = state.windows.len();
        state.windows.retain(|key, _| key.identifier != identifier);
        before - state.windows.len()
    }

    /// Drop buckets whose window has ended; returns how many were removed
    pub fn sweep_expired(&self) -> usize {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.sweep(unix_millis())
    }

    /// Number of buckets currently held in memory
    pub fn tracked_keys(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.windows.len())
            .unwrap_or_default()
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_040_000;

    #[test]
    fn test_exactly_max_requests_allowed() {
        let limiter = RateLimiter::default();
        let options = RateLimitOptions::per_minute(100);

        for i in 0..100 {
            let decision = limiter.check_limit_at("1.2.3.4", &options, T0 + i).unwrap();
            assert!(decision.allowed, "request {} should be allowed", i + 1);
            assert_eq!(decision.remaining, 99 - u32::try_from(i).unwrap());
        }

        let decision = limiter.check_limit_at("1.2.3.4", &options, T0 + 100).unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.limit, 100);
    }

    #[test]
    fn test_next_window_resets_count() {
        let limiter = RateLimiter::default();
        let options = RateLimitOptions::new(2, Duration::from_secs(60));

        assert!(limiter.check_limit_at("a", &options, T0).unwrap().allowed);
        assert!(limiter.check_limit_at("a", &options, T0 + 1).unwrap().allowed);
        let denied = limiter.check_limit_at("a", &options, T0 + 2).unwrap();
        assert!(!denied.allowed);

        let next = limiter
            .check_limit_at("a", &options, denied.reset_time_ms)
            .unwrap();
        assert!(next.allowed);
        assert_eq!(next.remaining, 1);
    }

    #[test]
    fn test_reset_time_is_bucket_end() {
        let limiter = RateLimiter::default();
        let options = RateLimitOptions::per_minute(10);
        let decision = limiter.check_limit_at("a", &options, T0 + 15_000).unwrap();

        assert_eq!(decision.reset_time_ms, T0 + 60_000);
        assert_eq!(
            decision.retry_after(T0 + 15_000),
            Duration::from_millis(45_000)
        );
    }

    #[test]
    fn test_identifiers_are_independent() {
        let limiter = RateLimiter::default();
        let options = RateLimitOptions::per_minute(1);

        assert!(limiter.check_limit_at("a", &options, T0).unwrap().allowed);
        assert!(!limiter.check_limit_at("a", &options, T0).unwrap().allowed);
        assert!(limiter.check_limit_at("b", &options, T0).unwrap().allowed);
    }

    #[test]
    fn test_boundary_allows_double_burst() {
        let limiter = RateLimiter::default();
        let options = RateLimitOptions::per_minute(5);
        let end_of_bucket = T0 + 59_999;

        let mut allowed = 0;
        for _ in 0..5 {
            allowed += u32::from(limiter.check_limit_at("a", &options, end_of_bucket).unwrap().allowed);
        }
        for _ in 0..5 {
            allowed += u32::from(limiter.check_limit_at("a", &options, T0 + 60_000).unwrap().allowed);
        }
        assert_eq!(allowed, 10);
    }

    #[test]
    fn test_reset_limit_matches_exact_identifier() {
        let limiter = RateLimiter::default();
        let options = RateLimitOptions::per_minute(1);

        limiter.check_limit_at("1.2.3.4", &options, T0).unwrap();
        limiter.check_limit_at("1.2.3.4", &options, T0 + 60_000).unwrap();
        limiter.check_limit_at("1.2.3.45", &options, T0).unwrap();

        assert_eq!(limiter.reset_limit("1.2.3.4"), 2);
        assert_eq!(limiter.tracked_keys(), 1);
        assert!(limiter.check_limit_at("1.2.3.4", &options, T0).unwrap().allowed);
        assert!(!limiter.check_limit_at("1.2.3.45", &options, T0).unwrap().allowed);
    }

    #[test]
    fn test_expired_windows_are_swept() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            sweep_interval: 3,
            max_tracked_keys: 1_000,
        });
        let options = RateLimitOptions::per_second(10);

        limiter.check_limit_at("a", &options, T0).unwrap();
        limiter.check_limit_at("b", &options, T0).unwrap();
        assert_eq!(limiter.tracked_keys(), 2);

        // third check triggers the sweep, both earlier buckets have ended
        limiter.check_limit_at("c", &options, T0 + 5_000).unwrap();
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_sweep_when_key_limit_reached() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            sweep_interval: u64::MAX,
            max_tracked_keys: 2,
        });
        let options = RateLimitOptions::per_second(10);

        limiter.check_limit_at("a", &options, T0).unwrap();
        limiter.check_limit_at("b", &options, T0).unwrap();
        limiter.check_limit_at("c", &options, T0 + 2_000).unwrap();
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_full_table_of_live_keys_backs_off_sweeping() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            sweep_interval: u64::MAX,
            max_tracked_keys: 4,
        });
        let options = RateLimitOptions::per_second(10);

        for id in ["a", "b", "c", "d"] {
            limiter.check_limit_at(id, &options, T0).unwrap();
        }
        // sweeps at 4 live keys, reclaims nothing and waits for 8
        limiter.check_limit_at("e", &options, T0).unwrap();
        assert_eq!(limiter.tracked_keys(), 5);

        // a..e have expired but the table is still below the raised trigger
        for id in ["f", "g", "h"] {
            limiter.check_limit_at(id, &options, T0 + 1_000).unwrap();
        }
        assert_eq!(limiter.tracked_keys(), 8);

        limiter.check_limit_at("i", &options, T0 + 1_000).unwrap();
        assert_eq!(limiter.tracked_keys(), 4);
    }

    #[test]
    fn test_invalid_options_are_rejected() {
        let limiter = RateLimiter::default();
        let zero_window = RateLimitOptions::new(10, Duration::ZERO);
        assert!(matches!(
            limiter.check_limit("a", &zero_window),
            Err(ResilienceError::InvalidConfig(_))
        ));

        let zero_max = RateLimitOptions::new(0, Duration::from_secs(1));
        assert!(matches!(
            limiter.check_limit("a", &zero_max),
            Err(ResilienceError::InvalidConfig(_))
        ));
    }
}
