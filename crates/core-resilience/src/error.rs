//! Shared error type for the resilience primitives
//!
//! Callers classify their own failures as transient or permanent when they
//! wrap them; everything downstream (breaker accounting, retry decisions)
//! reads that classification instead of inspecting error text.

use std::time::Duration;
use thiserror::Error;

/// Boxed error type accepted from calling clients.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced or propagated by the resilience layer.
#[derive(Debug, Error)]
pub enum ResilienceError {
    /// Failure that may succeed on retry (network drop, 5xx, broken pipe).
    #[error("transient failure: {0}")]
    Transient(#[source] BoxError),

    /// Failure that will not succeed on retry (auth, validation, bad request).
    #[error("permanent failure: {0}")]
    Permanent(#[source] BoxError),

    /// The caller cancelled the operation. Never counted against a breaker,
    /// never retried.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Admission was denied for `key` after waiting up to the caller's budget.
    #[error("rate limit exceeded for key '{key}' after waiting {waited:?}")]
    RateLimitExceeded { key: String, waited: Duration },

    /// The named breaker is open; the dependency is known-bad right now.
    /// `last_failure` is a rendering of the error that opened it, when
    /// one was recorded. The live error went back to the caller that hit
    /// it, so rejections carry its text, not the error itself.
    #[error("circuit breaker '{name}' is open")]
    CircuitOpen {
        name: String,
        last_failure: Option<String>,
    },

    /// The retry budget for `key` is spent; `source` is the final attempt's
    /// error, preserved for the log chain.
    #[error("retries exhausted for '{key}' after {attempts} attempts")]
    RetriesExhausted {
        key: String,
        attempts: u32,
        #[source]
        source: Box<ResilienceError>,
    },

    /// The pool has been shut down.
    #[error("connection pool is closed")]
    PoolClosed,

    /// Construction-time parameter rejection.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ResilienceError {
    /// Wrap a caller error as retryable.
    pub fn transient(err: impl Into<BoxError>) -> Self {
        Self::Transient(err.into())
    }

    /// Wrap a caller error as terminal.
    pub fn permanent(err: impl Into<BoxError>) -> Self {
        Self::Permanent(err.into())
    }

    /// True when a retry of the same operation could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }

    /// True when repeating the operation will certainly fail again.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    /// Whether this error counts toward a breaker's failure threshold.
    ///
    /// Cancellations, permanent errors, and the layer's own rejections
    /// (rate limit, open breaker) pass through uncounted: tripping on
    /// those would open circuits against healthy dependencies.
    pub fn should_trip_breaker(&self) -> bool {
        self.is_transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn io_refused() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused")
    }

    #[test]
    fn test_transient_classification() {
        let err = ResilienceError::transient(io_refused());
        assert!(err.is_transient());
        assert!(!err.is_permanent());
        assert!(err.should_trip_breaker());

        let err = ResilienceError::Timeout(Duration::from_secs(5));
        assert!(err.is_transient());
        assert!(err.should_trip_breaker());
    }

    #[test]
    fn test_permanent_and_cancelled_never_trip() {
        let err = ResilienceError::permanent("invalid credentials");
        assert!(err.is_permanent());
        assert!(!err.should_trip_breaker());

        assert!(!ResilienceError::Cancelled.should_trip_breaker());
        assert!(!ResilienceError::PoolClosed.should_trip_breaker());
    }

    #[test]
    fn test_retries_exhausted_preserves_cause() {
        let err = ResilienceError::RetriesExhausted {
            key: "cloud_api".to_string(),
            attempts: 3,
            source: Box::new(ResilienceError::transient(io_refused())),
        };
        let source = std::error::Error::source(&err).expect("source retained");
        assert!(source.to_string().contains("transient failure"));
        // The outer wrapper itself is not retryable again.
        assert!(!err.is_transient());
    }

    #[test]
    fn test_circuit_open_display_names_breaker() {
        let err = ResilienceError::CircuitOpen {
            name: "timeseries".to_string(),
            last_failure: Some("transient failure: connection refused".to_string()),
        };
        assert!(err.to_string().contains("timeseries"));
        assert!(!err.should_trip_breaker());
    }
}
