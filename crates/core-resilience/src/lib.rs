//! Helios Core Resilience: Pure-logic fault tolerance primitives
//!
//! # Overview
//!
//! This crate provides the building blocks every outbound call in a Helios
//! service goes through when talking to an external dependency. It includes:
//!
//! - **Rate Limiter**: Per-key token bucket admission control with burst capacity
//! - **Circuit Breaker**: Fails fast against a known-bad dependency, probes recovery with a single trial
//! - **Connection Pool**: Health-checked reuse of expensive client handles
//! - **Resilient Executor**: Rate limiting, circuit breaking, pooling, and retry composed as one policy
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Wire protocols and payload shapes (HTTP, line protocol, RESP)
//! - Which dependency is being called (cloud API, time-series store, cache)
//! - Application-specific concerns
//!
//! Calling clients own error classification: they wrap their failures as
//! transient or permanent ([`ResilienceError`]), and this layer's breaker
//! accounting and retry decisions read that classification instead of
//! guessing from error text.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Calling Client                  │
//! │  (cloud API / time-series / cache)      │
//! └─────────────┬───────────────────────────┘
//!               │ execute(key, policy, op)
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Resilient Executor                │  ← One coherent policy
//! │  (admission once, retry w/ backoff)     │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Rate Limiter                      │  ← Consulted once per
//! │  (token bucket per key)                 │    logical operation
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker                   │  ← Sees every attempt,
//! │  (closed / open / half-open)            │    trips mid-retry
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Connection Pool (where pooled)    │  ← Health-checked checkout,
//! │  (eager init, overflow over blocking)   │    guaranteed release
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!         External Dependency
//! ```
//!
//! # Usage Example
//!
//! ```no_run
//! use helios_core_resilience::{
//!     CircuitBreaker, CircuitBreakerConfig, RateLimiter, ResilienceError,
//!     ResilientExecutor, RetryPolicy,
//! };
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let limiter = RateLimiter::new(30, Duration::from_secs(60), 10)?;
//! let breaker = CircuitBreaker::new("cloud_api", CircuitBreakerConfig::default())?;
//! let executor = ResilientExecutor::new(limiter, breaker);
//!
//! let reading = executor
//!     .execute("cloud_api", &RetryPolicy::default(), || async {
//!         // fetch the latest temperature reading here
//!         Ok::<_, ResilienceError>(21.5f64)
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod connection_pool;
pub mod error;
pub mod executor;
pub mod rate_limiter;

// Re-export main types for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStatus};
pub use connection_pool::{ConnectionFactory, ConnectionPool, PoolConfig, PoolGuard, PoolStats};
pub use error::{BoxError, ResilienceError};
pub use executor::{ResilientExecutor, RetryPolicy};
pub use rate_limiter::RateLimiter;

#[cfg(feature = "governor-impl")]
pub use rate_limiter::governor_impl::KeyedRateLimiter;

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use helios_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use super::connection_pool::{ConnectionFactory, ConnectionPool, PoolConfig, PoolStats};
    pub use super::error::ResilienceError;
    pub use super::executor::{ResilientExecutor, RetryPolicy};
    pub use super::rate_limiter::RateLimiter;
}
