/*!
 * Helios - resilience layer for temperature telemetry ingestion
 *
 * Wraps every network dependency of the ingest service with:
 * - Token-bucket rate limiting with burst capacity
 * - Circuit breakers with single-trial recovery probing
 * - Bounded connection pools with health-checked reuse
 * - Retry with exponential backoff and jitter
 * - TOML configuration with environment overrides
 * - JSON health snapshots for the service's health endpoint
 *
 * Version: 0.3.0
 */

pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod stack;

// Re-export commonly used types
pub use config::{HeliosConfig, LogLevel, LoggingConfig, UpstreamProfile};
pub use error::{HeliosError, Result};
pub use health::{HealthReport, PoolHealth, UpstreamHealth};
pub use stack::{IngestStack, Upstream};

// The underlying components, for callers wiring their own chains
pub use helios_core_resilience as resilience;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
