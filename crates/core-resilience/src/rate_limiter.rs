//! Token bucket rate limiting with per-key admission control
//!
//! Each key (endpoint, tenant, operation class) gets its own bucket that
//! refills continuously at `rate_limit / time_window` tokens per second and
//! holds at most `burst_limit` tokens. Admission consumes one token; a
//! rejection consumes nothing.

use super::error::ResilienceError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Poll interval while waiting for admission in [`RateLimiter::acquire`].
const ADMISSION_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// One bucket per key. `tokens` stays within `0.0..=burst` at every
/// observation point; fractional tokens accumulate between checks.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(burst: f64, now: Instant) -> Self {
        Self {
            tokens: burst,
            last_refill: now,
        }
    }

    fn refill(&mut self, rate: f64, burst: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        self.last_refill = now;
    }
}

#[derive(Debug)]
struct LimiterShared {
    /// Tokens per second.
    refill_rate: f64,
    burst: f64,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

/// Token bucket rate limiter shared by all callers of one dependency.
///
/// Cheap to clone; clones share the same bucket map. The bucket lock is
/// held only for the token arithmetic, never across an await.
///
/// # Example
///
/// ```no_run
/// use helios_core_resilience::RateLimiter;
/// use std::time::Duration;
///
/// # fn main() -> Result<(), helios_core_resilience::ResilienceError> {
/// // 30 requests per minute, bursts of up to 10
/// let limiter = RateLimiter::new(30, Duration::from_secs(60), 10)?;
/// if limiter.check("cloud_api") {
///     // admitted
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RateLimiter {
    shared: Arc<LimiterShared>,
}

impl RateLimiter {
    /// Create a limiter admitting `rate_limit` tokens per `time_window`,
    /// with bursts of up to `burst_limit`.
    ///
    /// Zero values are configuration errors and fail fast here rather
    /// than producing a limiter that admits nothing (or everything).
    pub fn new(
        rate_limit: u32,
        time_window: Duration,
        burst_limit: u32,
    ) -> Result<Self, ResilienceError> {
        if rate_limit == 0 {
            return Err(ResilienceError::InvalidConfig(
                "rate_limit must be > 0".to_string(),
            ));
        }
        if time_window.is_zero() {
            return Err(ResilienceError::InvalidConfig(
                "time_window must be > 0".to_string(),
            ));
        }
        if burst_limit == 0 {
            return Err(ResilienceError::InvalidConfig(
                "burst_limit must be > 0".to_string(),
            ));
        }

        Ok(Self {
            shared: Arc::new(LimiterShared {
                refill_rate: rate_limit as f64 / time_window.as_secs_f64(),
                burst: burst_limit as f64,
                buckets: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Convenience constructor: `rate` tokens per second.
    pub fn per_second(rate: u32, burst_limit: u32) -> Result<Self, ResilienceError> {
        Self::new(rate, Duration::from_secs(1), burst_limit)
    }

    /// Check admission for `key`, consuming one token if admitted.
    ///
    /// A key's bucket is created full on first use. Rejections consume
    /// nothing, so a rejected caller that backs off leaves the bucket
    /// exactly as it found it.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.shared.buckets.lock().unwrap();
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::full(self.shared.burst, now));
        bucket.refill(self.shared.refill_rate, self.shared.burst, now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            trace!(key, remaining = bucket.tokens, "rate limit admitted");
            true
        } else {
            trace!(key, remaining = bucket.tokens, "rate limit rejected");
            false
        }
    }

    /// Wait until `key` is admitted, polling every
    /// [`ADMISSION_RETRY_INTERVAL`], for at most `max_wait`.
    ///
    /// Always performs at least one check, so `max_wait == 0` degrades to
    /// a non-blocking attempt. The failure carries how long the caller
    /// actually waited.
    pub async fn acquire(&self, key: &str, max_wait: Duration) -> Result<(), ResilienceError> {
        let started = Instant::now();
        let deadline = started + max_wait;

        loop {
            if self.check(key) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ResilienceError::RateLimitExceeded {
                    key: key.to_string(),
                    waited: now.saturating_duration_since(started),
                });
            }
            let remaining = deadline.saturating_duration_since(now);
            tokio::time::sleep(ADMISSION_RETRY_INTERVAL.min(remaining)).await;
        }
    }

    /// Current token count for `key` after refill, without consuming.
    /// Unseen keys report a full bucket.
    pub fn available(&self, key: &str) -> f64 {
        let now = Instant::now();
        let mut buckets = self.shared.buckets.lock().unwrap();
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::full(self.shared.burst, now));
        bucket.refill(self.shared.refill_rate, self.shared.burst, now);
        bucket.tokens
    }

    /// Bucket capacity.
    pub fn burst_limit(&self) -> f64 {
        self.shared.burst
    }
}

/// Lock-free keyed rate limiter backed by the governor crate.
///
/// Same admission surface as [`RateLimiter`] for callers that prefer
/// governor's GCRA implementation over the bucket map.
#[cfg(feature = "governor-impl")]
pub mod governor_impl {
    use super::*;
    use governor::{
        clock::DefaultClock, state::keyed::DefaultKeyedStateStore, Quota,
        RateLimiter as Governor,
    };
    use std::num::NonZeroU32;

    pub struct KeyedRateLimiter {
        limiter: Arc<Governor<String, DefaultKeyedStateStore<String>, DefaultClock>>,
    }

    impl KeyedRateLimiter {
        pub fn new(
            rate_limit: u32,
            time_window: Duration,
            burst_limit: u32,
        ) -> Result<Self, ResilienceError> {
            let rate = NonZeroU32::new(rate_limit).ok_or_else(|| {
                ResilienceError::InvalidConfig("rate_limit must be > 0".to_string())
            })?;
            let burst = NonZeroU32::new(burst_limit).ok_or_else(|| {
                ResilienceError::InvalidConfig("burst_limit must be > 0".to_string())
            })?;

            let quota = Quota::with_period(time_window / rate.get())
                .ok_or_else(|| {
                    ResilienceError::InvalidConfig("time_window must be > 0".to_string())
                })?
                .allow_burst(burst);

            Ok(Self {
                limiter: Arc::new(Governor::keyed(quota)),
            })
        }

        pub fn check(&self, key: &str) -> bool {
            self.limiter.check_key(&key.to_string()).is_ok()
        }

        pub async fn acquire(
            &self,
            key: &str,
            max_wait: Duration,
        ) -> Result<(), ResilienceError> {
            let started = Instant::now();
            tokio::time::timeout(max_wait, self.limiter.until_key_ready(&key.to_string()))
                .await
                .map_err(|_| ResilienceError::RateLimitExceeded {
                    key: key.to_string(),
                    waited: started.elapsed(),
                })
        }
    }
}
