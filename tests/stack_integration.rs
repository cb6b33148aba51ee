/*!
 * Integration tests for the ingest resilience stack
 */

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tempfile::tempdir;

use helios::resilience::{
    CircuitState, ConnectionFactory, ConnectionPool, ResilienceError,
};
use helios::{HeliosConfig, IngestStack, LogLevel};

struct TelemetryConn {
    id: usize,
}

#[derive(Clone)]
struct TelemetryFactory {
    created: Arc<AtomicUsize>,
}

impl TelemetryFactory {
    fn new() -> Self {
        Self {
            created: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl ConnectionFactory<TelemetryConn> for TelemetryFactory {
    async fn create(&self) -> Result<TelemetryConn, ResilienceError> {
        let id = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(TelemetryConn { id })
    }

    async fn is_healthy(&self, _conn: &TelemetryConn) -> bool {
        true
    }
}

#[tokio::test(start_paused = true)]
async fn test_config_file_to_degraded_health_report() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("helios.toml");
    std::fs::write(
        &path,
        r#"
[cloud_api]
failure_threshold = 2
recovery_timeout_secs = 60
max_attempts = 1
jitter_fraction = 0.0

[timeseries]
pool_size = 3

[logging]
level = "warn"
"#,
    )
    .unwrap();

    let config = HeliosConfig::load(&path).unwrap();
    assert_eq!(config.logging.level, LogLevel::Warn);
    assert_eq!(config.timeseries.pool_size, 3);

    let stack = IngestStack::from_config(&config).unwrap();
    assert!(!stack.health().degraded);

    // Two consecutive failures hit the configured threshold
    for _ in 0..2 {
        let result = stack
            .cloud_api
            .run("fetch_reference", || async {
                Err::<f64, _>(ResilienceError::transient("cloud api returned 502"))
            })
            .await;
        assert!(result.is_err());
    }

    let report = stack.health();
    assert!(report.degraded);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["degraded"], true);
    assert_eq!(json["upstreams"].as_array().unwrap().len(), 3);

    let cloud = json["upstreams"]
        .as_array()
        .unwrap()
        .iter()
        .find(|upstream| upstream["name"] == "cloud_api")
        .unwrap();
    assert_eq!(cloud["circuit_state"], "open");
    assert_eq!(cloud["failure_count"], 2);
    assert!(cloud["last_failure"]
        .as_str()
        .unwrap()
        .contains("cloud api returned 502"));
}

#[tokio::test(start_paused = true)]
async fn test_env_overrides_reshape_the_stack() {
    let mut config = HeliosConfig::default();
    config
        .apply_env_with(|name| match name {
            "HELIOS_TIMESERIES_FAILURE_THRESHOLD" => Some("1".to_string()),
            "HELIOS_TIMESERIES_MAX_ATTEMPTS" => Some("1".to_string()),
            "HELIOS_TIMESERIES_BURST_LIMIT" => Some("3".to_string()),
            _ => None,
        })
        .unwrap();

    let stack = IngestStack::from_config(&config).unwrap();

    let result = stack
        .timeseries
        .run("write_reading", || async {
            Err::<(), _>(ResilienceError::transient("tsdb write refused"))
        })
        .await;
    assert!(result.is_err());

    // Threshold of one means a single failure opens the breaker
    assert_eq!(stack.timeseries.status().state, CircuitState::Open);
    // Burst of three with one admission consumed leaves two tokens
    assert_eq!(stack.timeseries.available_tokens("write_reading"), 2.0);
}

#[tokio::test(start_paused = true)]
async fn test_pooled_write_path() {
    let mut config = HeliosConfig::default();
    config.timeseries.pool_size = 2;
    let stack = IngestStack::from_config(&config).unwrap();

    let factory = TelemetryFactory::new();
    let pool = ConnectionPool::new(factory.clone(), config.timeseries.pool_config()).unwrap();
    pool.initialize().await.unwrap();
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);

    let conn_id = stack
        .timeseries
        .run_with_pool("write_reading", &pool, |conn| {
            let id = conn.id;
            async move { Ok::<_, ResilienceError>(id) }.boxed()
        })
        .await
        .unwrap();

    // LIFO reuse hands back the most recently created handle
    assert_eq!(conn_id, 1);
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);

    let stats = pool.stats();
    assert_eq!(stats.idle, 2);
    assert_eq!(stats.active, 0);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_recovery_clears_health() {
    let mut config = HeliosConfig::default();
    config.cache.failure_threshold = 2;
    config.cache.recovery_timeout_secs = 1;
    config.cache.max_attempts = 1;
    config.cache.jitter_fraction = 0.0;
    let stack = IngestStack::from_config(&config).unwrap();

    for _ in 0..2 {
        let _ = stack
            .cache
            .run("get_reading", || async {
                Err::<(), _>(ResilienceError::transient("cache refused"))
            })
            .await;
    }
    assert!(stack.health().degraded);

    // Past the cool-down the next call becomes the recovery trial
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    stack
        .cache
        .run("get_reading", || async { Ok::<_, ResilienceError>(()) })
        .await
        .unwrap();

    let report = stack.health();
    assert!(!report.degraded);
    let cache = report
        .upstreams
        .iter()
        .find(|upstream| upstream.name == "cache")
        .unwrap();
    assert!(cache.healthy);
    assert_eq!(cache.failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_rejection_skips_the_operation() {
    let mut config = HeliosConfig::default();
    config.cache.rate_limit = 1;
    config.cache.time_window_secs = 60;
    config.cache.burst_limit = 2;
    config.cache.admission_wait_ms = 0;
    let stack = IngestStack::from_config(&config).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let op_calls = Arc::clone(&calls);
        stack
            .cache
            .run("get_reading", move || {
                let calls = Arc::clone(&op_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ResilienceError>(())
                }
            })
            .await
            .unwrap();
    }

    let op_calls = Arc::clone(&calls);
    let rejected = stack
        .cache
        .run("get_reading", move || {
            let calls = Arc::clone(&op_calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ResilienceError>(())
            }
        })
        .await;

    assert!(matches!(
        rejected,
        Err(ResilienceError::RateLimitExceeded { .. })
    ));
    // The rejected operation never ran
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
