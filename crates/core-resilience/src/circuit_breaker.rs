//! Circuit breaker for failing fast against known-bad dependencies
//!
//! Three states:
//! - Closed: normal operation, calls pass through
//! - Open: calls are rejected immediately, the dependency gets a cool-down
//! - HalfOpen: one trial call probes recovery; everyone else is rejected
//!
//! Only errors whose classification says so count toward the failure
//! threshold (see [`ResilienceError::should_trip_breaker`]); cancellations
//! and permanent client errors pass through without moving the state.

use super::error::ResilienceError;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Breaker state as seen by callers and health endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive counted failures that open the circuit.
    pub failure_threshold: u32,
    /// Cool-down before an open circuit admits a trial call.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    fn validate(&self) -> Result<(), ResilienceError> {
        if self.failure_threshold == 0 {
            return Err(ResilienceError::InvalidConfig(
                "failure_threshold must be > 0".to_string(),
            ));
        }
        if self.recovery_timeout.is_zero() {
            return Err(ResilienceError::InvalidConfig(
                "recovery_timeout must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time snapshot for observability.
#[derive(Debug, Clone)]
pub struct CircuitStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    /// Time since the failure that last moved the breaker, if any.
    pub last_failure_age: Option<Duration>,
    /// Rendering of that failure.
    pub last_failure: Option<String>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    last_failure: Option<String>,
    trial_in_flight: bool,
    /// Bumped whenever the trial slot changes hands, so a stale
    /// [`TrialGuard`] from a cancelled call cannot clear a newer trial.
    trial_epoch: u64,
}

#[derive(Debug)]
struct BreakerShared {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

/// Releases the half-open trial slot if the trial call is dropped before
/// it records an outcome.
struct TrialGuard {
    shared: Arc<BreakerShared>,
    epoch: u64,
    armed: bool,
}

impl TrialGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TrialGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut st = self.shared.state.lock().unwrap();
        if st.trial_epoch == self.epoch && st.trial_in_flight {
            st.trial_in_flight = false;
            debug!(breaker = %self.shared.name, "half-open trial abandoned, slot released");
        }
    }
}

/// Circuit breaker shared by all callers of one dependency.
///
/// Cheap to clone; clones share state. The state lock is held only for
/// transitions, never while the wrapped operation runs.
///
/// # Example
///
/// ```no_run
/// use helios_core_resilience::{CircuitBreaker, CircuitBreakerConfig, ResilienceError};
///
/// # async fn example() -> Result<(), ResilienceError> {
/// let breaker = CircuitBreaker::new("timeseries", CircuitBreakerConfig::default())?;
/// let rows = breaker
///     .call(|| async {
///         // talk to the dependency here
///         Ok::<_, ResilienceError>(42)
///     })
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    shared: Arc<BreakerShared>,
}

impl CircuitBreaker {
    /// Create a breaker named for the dependency it guards.
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Result<Self, ResilienceError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(BreakerShared {
                name: name.into(),
                config,
                state: Mutex::new(BreakerState {
                    state: CircuitState::Closed,
                    failure_count: 0,
                    last_failure_at: None,
                    last_failure: None,
                    trial_in_flight: false,
                    trial_epoch: 0,
                }),
            }),
        })
    }

    /// Run `op` through the state machine.
    ///
    /// Rejections surface as [`ResilienceError::CircuitOpen`] without
    /// invoking `op`. The operation's own error comes back unchanged so
    /// callers keep their classification; the breaker records only a
    /// rendering of it.
    pub async fn call<F, Fut, T>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, ResilienceError>>,
    {
        let trial = self.admit()?;
        match op().await {
            Ok(value) => {
                self.on_success(trial);
                Ok(value)
            }
            Err(err) => {
                self.on_failure(&err, trial);
                Err(err)
            }
        }
    }

    /// Admission check. `Some(guard)` means this call is the half-open
    /// trial and must report its outcome (or release the slot on drop).
    fn admit(&self) -> Result<Option<TrialGuard>, ResilienceError> {
        let mut st = self.shared.state.lock().unwrap();
        match st.state {
            CircuitState::Closed => Ok(None),
            CircuitState::Open => {
                let cooled_down = st
                    .last_failure_at
                    .map(|at| at.elapsed() >= self.shared.config.recovery_timeout)
                    .unwrap_or(true);
                if cooled_down {
                    st.state = CircuitState::HalfOpen;
                    st.trial_in_flight = true;
                    st.trial_epoch += 1;
                    debug!(breaker = %self.shared.name, "cool-down elapsed, admitting trial call");
                    Ok(Some(TrialGuard {
                        shared: Arc::clone(&self.shared),
                        epoch: st.trial_epoch,
                        armed: true,
                    }))
                } else {
                    Err(self.rejection(&st))
                }
            }
            CircuitState::HalfOpen => {
                if st.trial_in_flight {
                    Err(self.rejection(&st))
                } else {
                    st.trial_in_flight = true;
                    st.trial_epoch += 1;
                    Ok(Some(TrialGuard {
                        shared: Arc::clone(&self.shared),
                        epoch: st.trial_epoch,
                        armed: true,
                    }))
                }
            }
        }
    }

    fn rejection(&self, st: &BreakerState) -> ResilienceError {
        ResilienceError::CircuitOpen {
            name: self.shared.name.clone(),
            last_failure: st.last_failure.clone(),
        }
    }

    fn on_success(&self, trial: Option<TrialGuard>) {
        let mut st = self.shared.state.lock().unwrap();
        match trial {
            Some(mut guard) => {
                guard.disarm();
                if st.trial_epoch != guard.epoch {
                    // reset() or force_open() took over while the trial ran
                    return;
                }
                st.trial_in_flight = false;
                st.state = CircuitState::Closed;
                st.failure_count = 0;
                st.last_failure_at = None;
                st.last_failure = None;
                info!(breaker = %self.shared.name, "trial call succeeded, circuit closed");
            }
            None => {
                if st.state == CircuitState::Closed {
                    st.failure_count = 0;
                }
            }
        }
    }

    fn on_failure(&self, err: &ResilienceError, trial: Option<TrialGuard>) {
        let mut st = self.shared.state.lock().unwrap();

        if !err.should_trip_breaker() {
            // Excluded classes are not counted, but a trial slot still
            // has to be handed back.
            if let Some(mut guard) = trial {
                guard.disarm();
                if st.trial_epoch == guard.epoch {
                    st.trial_in_flight = false;
                }
            }
            return;
        }

        match trial {
            Some(mut guard) => {
                guard.disarm();
                if st.trial_epoch != guard.epoch {
                    return;
                }
                st.trial_in_flight = false;
                st.state = CircuitState::Open;
                st.last_failure_at = Some(Instant::now());
                st.last_failure = Some(err.to_string());
                warn!(breaker = %self.shared.name, error = %err, "trial call failed, circuit re-opened");
            }
            None => {
                // Late results from before a transition are ignored; only
                // failures observed while Closed move the counter.
                if st.state != CircuitState::Closed {
                    return;
                }
                st.failure_count += 1;
                if st.failure_count >= self.shared.config.failure_threshold {
                    st.state = CircuitState::Open;
                    st.last_failure_at = Some(Instant::now());
                    st.last_failure = Some(err.to_string());
                    warn!(
                        breaker = %self.shared.name,
                        failures = st.failure_count,
                        error = %err,
                        "failure threshold reached, circuit opened"
                    );
                } else {
                    debug!(
                        breaker = %self.shared.name,
                        failures = st.failure_count,
                        threshold = self.shared.config.failure_threshold,
                        "counted failure"
                    );
                }
            }
        }
    }

    /// Force the breaker closed and clear its failure history.
    pub fn reset(&self) {
        let mut st = self.shared.state.lock().unwrap();
        st.state = CircuitState::Closed;
        st.failure_count = 0;
        st.last_failure_at = None;
        st.last_failure = None;
        st.trial_in_flight = false;
        st.trial_epoch += 1;
        info!(breaker = %self.shared.name, "circuit manually reset");
    }

    /// Force the breaker open, starting a fresh cool-down now.
    pub fn force_open(&self) {
        let mut st = self.shared.state.lock().unwrap();
        st.state = CircuitState::Open;
        st.last_failure_at = Some(Instant::now());
        st.trial_in_flight = false;
        st.trial_epoch += 1;
        warn!(breaker = %self.shared.name, "circuit manually forced open");
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> CircuitState {
        self.shared.state.lock().unwrap().state
    }

    pub fn failure_count(&self) -> u32 {
        self.shared.state.lock().unwrap().failure_count
    }

    /// Snapshot for health reporting.
    pub fn status(&self) -> CircuitStatus {
        let st = self.shared.state.lock().unwrap();
        CircuitStatus {
            name: self.shared.name.clone(),
            state: st.state,
            failure_count: st.failure_count,
            failure_threshold: self.shared.config.failure_threshold,
            recovery_timeout: self.shared.config.recovery_timeout,
            last_failure_age: st.last_failure_at.map(|at| at.elapsed()),
            last_failure: st.last_failure.clone(),
        }
    }
}
