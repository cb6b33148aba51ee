/*!
 * Composition root wiring configuration into resilience chains
 */

use std::future::Future;

use futures::future::BoxFuture;
use tracing::{debug, info};

use helios_core_resilience::{
    CircuitBreaker, CircuitStatus, ConnectionPool, RateLimiter, ResilienceError,
    ResilientExecutor, RetryPolicy,
};

use crate::config::{HeliosConfig, UpstreamProfile};
use crate::error::Result;
use crate::health::{HealthReport, UpstreamHealth};

/// One upstream dependency wrapped in the full resilience chain.
///
/// Owns the executor (and through it the limiter and breaker) plus the
/// retry policy derived from the upstream's profile. Clients hold a clone
/// and call [`Upstream::run`] around every network operation; clones share
/// the same breaker and buckets.
#[derive(Debug, Clone)]
pub struct Upstream {
    name: String,
    executor: ResilientExecutor,
    policy: RetryPolicy,
}

impl Upstream {
    /// Build the chain for one named upstream from its profile.
    pub fn from_profile(name: &str, profile: &UpstreamProfile) -> Result<Self> {
        let limiter = RateLimiter::new(
            profile.rate_limit,
            profile.time_window(),
            profile.burst_limit,
        )?;
        let breaker = CircuitBreaker::new(name, profile.breaker_config())?;
        let executor =
            ResilientExecutor::new(limiter, breaker).with_admission_wait(profile.admission_wait());

        debug!(
            upstream = name,
            rate_limit = profile.rate_limit,
            burst_limit = profile.burst_limit,
            failure_threshold = profile.failure_threshold,
            "resilience chain built"
        );

        Ok(Self {
            name: name.to_string(),
            executor,
            policy: profile.retry_policy(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run one logical operation through rate limiting, the breaker, and
    /// the retry loop.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        op: F,
    ) -> std::result::Result<T, ResilienceError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, ResilienceError>>,
    {
        self.executor.execute(operation, &self.policy, op).await
    }

    /// Run one logical operation that needs a pooled connection.
    pub async fn run_with_pool<C, R, F>(
        &self,
        operation: &str,
        pool: &ConnectionPool<C>,
        op: F,
    ) -> std::result::Result<R, ResilienceError>
    where
        C: Send + 'static,
        R: Send,
        F: for<'c> Fn(&'c mut C) -> BoxFuture<'c, std::result::Result<R, ResilienceError>>,
    {
        self.executor
            .execute_with_pool(operation, &self.policy, pool, op)
            .await
    }

    /// Snapshot of this upstream's breaker for health reporting.
    pub fn status(&self) -> CircuitStatus {
        self.executor.breaker().status()
    }

    /// Remaining admission allowance for an operation key.
    pub fn available_tokens(&self, operation: &str) -> f64 {
        self.executor.limiter().available(operation)
    }
}

/// Every upstream the ingest path talks to, wired from one configuration.
///
/// Built once at startup; clients receive clones of the individual
/// upstreams. There is no process-wide instance, so tests construct a
/// fresh stack per case.
#[derive(Debug, Clone)]
pub struct IngestStack {
    pub cloud_api: Upstream,
    pub timeseries: Upstream,
    pub cache: Upstream,
}

impl IngestStack {
    /// Validate the configuration and build all three upstream chains.
    pub fn from_config(config: &HeliosConfig) -> Result<Self> {
        config.validate()?;
        let stack = Self {
            cloud_api: Upstream::from_profile("cloud_api", &config.cloud_api)?,
            timeseries: Upstream::from_profile("timeseries", &config.timeseries)?,
            cache: Upstream::from_profile("cache", &config.cache)?,
        };
        info!("ingest stack wired");
        Ok(stack)
    }

    /// Aggregate health across every upstream.
    pub fn health(&self) -> HealthReport {
        HealthReport::new(vec![
            UpstreamHealth::from_status(self.cloud_api.status()),
            UpstreamHealth::from_status(self.timeseries.status()),
            UpstreamHealth::from_status(self.cache.status()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HeliosError;
    use helios_core_resilience::CircuitState;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick_profile() -> UpstreamProfile {
        UpstreamProfile {
            failure_threshold: 2,
            recovery_timeout_secs: 1,
            max_attempts: 1,
            base_backoff_ms: 10,
            jitter_fraction: 0.0,
            ..UpstreamProfile::default()
        }
    }

    #[test]
    fn test_stack_builds_from_default_config() {
        let stack = IngestStack::from_config(&HeliosConfig::default()).unwrap();
        assert_eq!(stack.cloud_api.name(), "cloud_api");
        assert_eq!(stack.timeseries.name(), "timeseries");
        assert_eq!(stack.cache.name(), "cache");

        let report = stack.health();
        assert!(!report.degraded);
        assert_eq!(report.upstreams.len(), 3);
    }

    #[test]
    fn test_invalid_config_is_rejected_before_wiring() {
        let mut config = HeliosConfig::default();
        config.cache.burst_limit = 0;
        let err = IngestStack::from_config(&config).unwrap_err();
        assert!(matches!(err, HeliosError::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_runs_operation() {
        let upstream = Upstream::from_profile("timeseries", &UpstreamProfile::default()).unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        let op_calls = Arc::clone(&calls);
        let written = upstream
            .run("write_reading", move || {
                let calls = Arc::clone(&op_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ResilienceError>(21.5f64)
                }
            })
            .await
            .unwrap();

        assert_eq!(written, 21.5);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(upstream.status().state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_trips_breaker_at_profile_threshold() {
        let upstream = Upstream::from_profile("timeseries", &quick_profile()).unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let op_calls = Arc::clone(&calls);
            let result = upstream
                .run("write_reading", move || {
                    let calls = Arc::clone(&op_calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(ResilienceError::transient("tsdb unreachable"))
                    }
                })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(upstream.status().state, CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Open breaker rejects without reaching the operation
        let op_calls = Arc::clone(&calls);
        let rejected = upstream
            .run("write_reading", move || {
                let calls = Arc::clone(&op_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), _>(())
                }
            })
            .await;
        assert!(matches!(rejected, Err(ResilienceError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_reflects_tripped_upstream() {
        let mut config = HeliosConfig::default();
        config.cache = quick_profile();
        let stack = IngestStack::from_config(&config).unwrap();

        for _ in 0..2 {
            let _ = stack
                .cache
                .run("get_reading", || async {
                    Err::<(), _>(ResilienceError::transient("cache refused"))
                })
                .await;
        }

        let report = stack.health();
        assert!(report.degraded);
        let cache = report
            .upstreams
            .iter()
            .find(|upstream| upstream.name == "cache")
            .unwrap();
        assert!(!cache.healthy);
        assert_eq!(cache.circuit_state, "open");
        assert!(report
            .upstreams
            .iter()
            .filter(|upstream| upstream.name != "cache")
            .all(|upstream| upstream.healthy));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clones_share_breaker_state() {
        let upstream = Upstream::from_profile("cloud_api", &quick_profile()).unwrap();
        let clone = upstream.clone();

        for _ in 0..2 {
            let _ = clone
                .run("fetch_reference", || async {
                    Err::<(), _>(ResilienceError::transient("api down"))
                })
                .await;
        }

        assert_eq!(upstream.status().state, CircuitState::Open);
    }
}
