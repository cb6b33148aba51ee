//! Retry with backoff, composed over rate limiting and circuit breaking
//!
//! [`ResilientExecutor`] is the single entry point calling clients use for
//! one logical operation against an external dependency. The layering is
//! a contract, not an accident: admission is taken once per logical
//! operation (a retrying caller must not burn quota faster than a
//! succeeding one), while the breaker sees every individual attempt so it
//! can trip mid-retry.

use super::circuit_breaker::CircuitBreaker;
use super::connection_pool::ConnectionPool;
use super::error::ResilienceError;
use super::rate_limiter::RateLimiter;
use futures::future::BoxFuture;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

/// How long a caller may wait for rate-limit admission before the
/// operation fails, unless overridden per executor.
const DEFAULT_ADMISSION_WAIT: Duration = Duration::from_secs(5);

/// Retry budget and backoff shape for one class of operations.
///
/// A value object: construct per dependency, pass by reference to every
/// [`ResilientExecutor::execute`] call for that dependency.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total tries, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles each further retry.
    pub base_backoff: Duration,
    /// Cap on any single delay, before jitter.
    pub max_backoff: Duration,
    /// Uniform scatter applied to each delay, as a fraction in `[0, 1)`:
    /// the slept delay lands in `[d * (1 - jitter), d * (1 + jitter)]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
            jitter: 0.3,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.max_attempts == 0 {
            return Err(ResilienceError::InvalidConfig(
                "max_attempts must be > 0".to_string(),
            ));
        }
        if self.base_backoff.is_zero() {
            return Err(ResilienceError::InvalidConfig(
                "base_backoff must be > 0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(ResilienceError::InvalidConfig(
                "jitter must be within [0, 1)".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay before retrying after attempt `attempt` (1-based):
    /// `base * 2^(attempt-1)` capped at `max_backoff`, scattered by the
    /// jitter fraction.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.max_backoff);
        if self.jitter <= 0.0 {
            return capped;
        }
        let factor = rand::rng().random_range((1.0 - self.jitter)..(1.0 + self.jitter));
        capped.mul_f64(factor)
    }
}

/// Rate limiter, circuit breaker, and retry applied as one coherent
/// policy for a single dependency.
///
/// Cheap to clone; clones share the limiter and breaker.
#[derive(Debug, Clone)]
pub struct ResilientExecutor {
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    admission_wait: Duration,
}

impl ResilientExecutor {
    pub fn new(limiter: RateLimiter, breaker: CircuitBreaker) -> Self {
        Self {
            limiter,
            breaker,
            admission_wait: DEFAULT_ADMISSION_WAIT,
        }
    }

    /// Override how long callers may wait for rate-limit admission.
    pub fn with_admission_wait(mut self, max_wait: Duration) -> Self {
        self.admission_wait = max_wait;
        self
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Perform one logical operation under the full policy.
    ///
    /// Flow: rate-limit admission for `key` (once; an admission failure
    /// surfaces immediately and is never retried), then up to
    /// `policy.max_attempts` tries through the breaker. A rejection from
    /// an open breaker propagates at once: the dependency is known-bad,
    /// retrying harder helps nobody. Terminal errors return on first
    /// sighting; transient errors back off and loop; a spent budget wraps
    /// the last transient error as
    /// [`ResilienceError::RetriesExhausted`].
    ///
    /// Backoff sleeps hold no lock, so dropping the returned future
    /// cancels promptly.
    pub async fn execute<T, F, Fut>(
        &self,
        key: &str,
        policy: &RetryPolicy,
        op: F,
    ) -> Result<T, ResilienceError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, ResilienceError>>,
    {
        policy.validate()?;
        self.limiter.acquire(key, self.admission_wait).await?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.breaker.call(&op).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(key, attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err @ ResilienceError::CircuitOpen { .. }) => {
                    return Err(err);
                }
                Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        key,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay = ?delay,
                        error = %err,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) if err.is_transient() => {
                    return Err(ResilienceError::RetriesExhausted {
                        key: key.to_string(),
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Like [`execute`](Self::execute), with each attempt routed through
    /// the pool so every retry gets a fresh health-checked handle.
    pub async fn execute_with_pool<C, R, F>(
        &self,
        key: &str,
        policy: &RetryPolicy,
        pool: &ConnectionPool<C>,
        op: F,
    ) -> Result<R, ResilienceError>
    where
        C: Send + 'static,
        R: Send,
        F: for<'c> Fn(&'c mut C) -> BoxFuture<'c, Result<R, ResilienceError>>,
    {
        self.execute(key, policy, || pool.execute(&op)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::connection_pool::{ConnectionFactory, PoolConfig};
    use async_trait::async_trait;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn executor() -> ResilientExecutor {
        let limiter = RateLimiter::per_second(100, 100).unwrap();
        let breaker = CircuitBreaker::new("test", CircuitBreakerConfig::default()).unwrap();
        ResilientExecutor::new(limiter, breaker)
    }

    fn policy(max_attempts: u32, jitter: f64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            jitter,
        }
    }

    #[tokio::test]
    async fn test_terminal_error_calls_operation_exactly_once() {
        let executor = executor();
        let calls = Arc::new(AtomicU32::new(0));

        let op_calls = Arc::clone(&calls);
        let err = executor
            .execute("api", &policy(4, 0.0), move || {
                let calls = Arc::clone(&op_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ResilienceError::permanent("bad credentials"))
                }
            })
            .await
            .unwrap_err();

        assert!(err.is_permanent());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_retries_to_budget_then_wraps() {
        let executor = executor();
        let calls = Arc::new(AtomicU32::new(0));

        let op_calls = Arc::clone(&calls);
        let err = executor
            .execute("api", &policy(4, 0.0), move || {
                let calls = Arc::clone(&op_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ResilienceError::transient("connection reset"))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match &err {
            ResilienceError::RetriesExhausted { key, attempts, source } => {
                assert_eq!(key, "api");
                assert_eq!(*attempts, 4);
                assert!(source.to_string().contains("connection reset"));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert!(std::error::Error::source(&err).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failures() {
        let executor = executor();
        let calls = Arc::new(AtomicU32::new(0));

        let op_calls = Arc::clone(&calls);
        let value = executor
            .execute("api", &policy(5, 0.0), move || {
                let calls = Arc::clone(&op_calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ResilienceError::transient("flaky"))
                    } else {
                        Ok(21.5f64)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 21.5);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_without_jitter() {
        let executor = executor();
        let started = Instant::now();

        let _ = executor
            .execute("api", &policy(3, 0.0), || async {
                Err::<(), _>(ResilienceError::transient("down"))
            })
            .await;

        // Two sleeps: 100ms then 200ms, exact under the paused clock.
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_respects_jitter_bounds() {
        let executor = executor();
        let started = Instant::now();

        let _ = executor
            .execute("api", &policy(3, 0.5), || async {
                Err::<(), _>(ResilienceError::transient("down"))
            })
            .await;

        // Sleep n is base * 2^(n-1) scattered within 50%: the total lands
        // in [150ms, 450ms].
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(150), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(450), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn test_rate_limit_rejection_is_immediate_and_unretried() {
        let limiter = RateLimiter::new(1, Duration::from_secs(3600), 1).unwrap();
        let breaker = CircuitBreaker::new("test", CircuitBreakerConfig::default()).unwrap();
        let executor =
            ResilientExecutor::new(limiter.clone(), breaker).with_admission_wait(Duration::ZERO);
        assert!(limiter.check("api"));

        let calls = Arc::new(AtomicU32::new(0));
        let op_calls = Arc::clone(&calls);
        let err = executor
            .execute("api", &policy(4, 0.0), move || {
                let calls = Arc::clone(&op_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ResilienceError>(())
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ResilienceError::RateLimitExceeded { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_consumed_once_per_logical_operation() {
        // Slow refill keeps the arithmetic inert during the test.
        let limiter = RateLimiter::new(1, Duration::from_secs(3600), 2).unwrap();
        let breaker = CircuitBreaker::new("test", CircuitBreakerConfig::default()).unwrap();
        let executor = ResilientExecutor::new(limiter.clone(), breaker);

        let _ = executor
            .execute("api", &policy(3, 0.0), || async {
                Err::<(), _>(ResilienceError::transient("down"))
            })
            .await;

        // Three attempts, one token. The hour-long window refills only a
        // sliver during the two backoff sleeps.
        let available = limiter.available("api");
        assert!((1.0..1.001).contains(&available), "available {available}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_stops_the_retry_loop() {
        let limiter = RateLimiter::per_second(100, 100).unwrap();
        let breaker = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(30),
            },
        )
        .unwrap();
        let executor = ResilientExecutor::new(limiter, breaker.clone());

        let calls = Arc::new(AtomicU32::new(0));
        let op_calls = Arc::clone(&calls);
        let err = executor
            .execute("api", &policy(5, 0.0), move || {
                let calls = Arc::clone(&op_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ResilienceError::transient("down"))
                }
            })
            .await
            .unwrap_err();

        // The first failure tripped the breaker; the second attempt was
        // rejected without reaching the operation, ending the loop.
        assert!(matches!(err, ResilienceError::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    struct FlakyConnection {
        id: usize,
    }

    struct FlakyFactory {
        created: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ConnectionFactory<FlakyConnection> for FlakyFactory {
        async fn create(&self) -> Result<FlakyConnection, ResilienceError> {
            let id = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(FlakyConnection { id: id as usize })
        }

        async fn is_healthy(&self, _conn: &FlakyConnection) -> bool {
            true
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_with_pool_retries_with_fresh_checkout() {
        let created = Arc::new(AtomicU32::new(0));
        let pool = ConnectionPool::new(
            FlakyFactory {
                created: Arc::clone(&created),
            },
            PoolConfig {
                max_size: 1,
                ..PoolConfig::default()
            },
        )
        .unwrap();
        pool.initialize().await.unwrap();

        let executor = executor();
        let calls = Arc::new(AtomicU32::new(0));
        let op_calls = Arc::clone(&calls);
        let id = executor
            .execute_with_pool("tsdb", &policy(3, 0.0), &pool, move |conn| {
                let calls = Arc::clone(&op_calls);
                let id = conn.id;
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ResilienceError::transient("write failed"))
                    } else {
                        Ok(id)
                    }
                }
                .boxed()
            })
            .await
            .unwrap();

        assert_eq!(id, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Every attempt checked out and returned the same pooled handle.
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(pool.stats().active, 0);
    }
}
