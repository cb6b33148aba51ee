/*!
 * Health snapshot types for the ingest service
 */

use chrono::{DateTime, Utc};
use serde::Serialize;

use helios_core_resilience::{CircuitState, CircuitStatus, PoolStats};

/// Point-in-time health of every upstream, served from the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Wall-clock time the snapshot was taken
    pub generated_at: DateTime<Utc>,

    /// True when any breaker is away from Closed
    pub degraded: bool,

    pub upstreams: Vec<UpstreamHealth>,
}

impl HealthReport {
    pub fn new(upstreams: Vec<UpstreamHealth>) -> Self {
        let degraded = upstreams.iter().any(|upstream| !upstream.healthy);
        Self {
            generated_at: Utc::now(),
            degraded,
            upstreams,
        }
    }
}

/// Health of a single upstream dependency.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamHealth {
    pub name: String,
    pub healthy: bool,
    pub circuit_state: String,
    pub failure_count: u32,
    pub failure_threshold: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_since_last_failure: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolHealth>,
}

impl UpstreamHealth {
    /// Snapshot one breaker.
    pub fn from_status(status: CircuitStatus) -> Self {
        Self {
            name: status.name,
            healthy: status.state == CircuitState::Closed,
            circuit_state: status.state.to_string(),
            failure_count: status.failure_count,
            failure_threshold: status.failure_threshold,
            seconds_since_last_failure: status.last_failure_age.map(|age| age.as_secs_f64()),
            last_failure: status.last_failure,
            pool: None,
        }
    }

    /// Attach pool utilization to the snapshot.
    pub fn with_pool(mut self, stats: PoolStats) -> Self {
        self.pool = Some(PoolHealth::from_stats(stats));
        self
    }
}

/// Pool utilization at snapshot time.
#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub idle: usize,
    pub active: usize,
    pub max_size: usize,
    pub utilization: f64,
}

impl PoolHealth {
    fn from_stats(stats: PoolStats) -> Self {
        Self {
            idle: stats.idle,
            active: stats.active,
            max_size: stats.max_size,
            utilization: stats.utilization(),
        }
    }
}
