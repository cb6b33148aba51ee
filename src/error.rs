/*!
 * Error types for Helios
 */

use std::io;

use thiserror::Error;

use helios_core_resilience::ResilienceError;

pub type Result<T> = std::result::Result<T, HeliosError>;

/// Top-level error for the ingest service.
///
/// Upstream clients classify their failures here, then hand them to the
/// resilience layer through [`HeliosError::into_resilience`]. The layer
/// never inspects wire formats or status codes itself; this enum is where
/// that knowledge lives.
#[derive(Debug, Error)]
pub enum HeliosError {
    /// Configuration file missing, malformed, or failed validation
    #[error("configuration error: {0}")]
    Config(String),

    /// Socket-level failure reaching an upstream
    #[error("transport failure reaching {upstream}: {source}")]
    Transport {
        upstream: String,
        #[source]
        source: io::Error,
    },

    /// Upstream answered with a non-success status code
    #[error("{upstream} returned status {status}")]
    UpstreamStatus { upstream: String, status: u16 },

    /// Upstream rejected our credentials
    #[error("authentication rejected by {upstream}")]
    Authentication { upstream: String },

    /// Reading failed schema validation before any upstream was involved
    #[error("invalid reading: {0}")]
    InvalidReading(String),

    /// Error surfaced by the resilience layer itself
    #[error(transparent)]
    Resilience(#[from] ResilienceError),
}

impl HeliosError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            HeliosError::Transport { source, .. } => is_io_transient(source),
            HeliosError::UpstreamStatus { status, .. } => *status == 429 || *status >= 500,
            HeliosError::Resilience(err) => err.is_transient(),
            HeliosError::Config(_)
            | HeliosError::Authentication { .. }
            | HeliosError::InvalidReading(_) => false,
        }
    }

    /// Convert into the taxonomy the executor and breaker act on.
    ///
    /// Retryable failures become [`ResilienceError::Transient`] so the
    /// breaker counts them and the executor retries; everything else
    /// becomes [`ResilienceError::Permanent`] and returns on the first
    /// attempt. Errors already in the resilience taxonomy pass through
    /// unchanged.
    pub fn into_resilience(self) -> ResilienceError {
        match self {
            HeliosError::Resilience(err) => err,
            err if err.is_retryable() => ResilienceError::transient(err),
            err => ResilienceError::permanent(err),
        }
    }

    /// HTTP status reported to the producer whose write hit this error.
    pub fn http_status(&self) -> u16 {
        match self {
            HeliosError::InvalidReading(_) => 400,
            HeliosError::Config(_) => 500,
            HeliosError::Transport { .. }
            | HeliosError::UpstreamStatus { .. }
            | HeliosError::Authentication { .. } => 502,
            HeliosError::Resilience(err) => match err {
                ResilienceError::RateLimitExceeded { .. } => 429,
                ResilienceError::CircuitOpen { .. } | ResilienceError::PoolClosed => 503,
                ResilienceError::Timeout(_) => 504,
                // nginx convention for requests the client abandoned
                ResilienceError::Cancelled => 499,
                ResilienceError::Transient(_) | ResilienceError::RetriesExhausted { .. } => 502,
                ResilienceError::Permanent(_) | ResilienceError::InvalidConfig(_) => 500,
            },
        }
    }
}

/// I/O errors that tend to resolve on retry.
fn is_io_transient(err: &io::Error) -> bool {
    use io::ErrorKind::*;
    matches!(
        err.kind(),
        ConnectionRefused
            | ConnectionReset
            | ConnectionAborted
            | NotConnected
            | BrokenPipe
            | TimedOut
            | Interrupted
            | WouldBlock
    )
}

impl From<toml::de::Error> for HeliosError {
    fn from(err: toml::de::Error) -> Self {
        HeliosError::Config(format!("TOML parse error: {}", err))
    }
}
