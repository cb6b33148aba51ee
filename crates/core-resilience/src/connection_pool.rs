//! Generic connection pool with health-checked checkout and return
//!
//! Handles are created eagerly at startup, probed at every checkout and
//! return, and replaced when they go bad. An empty pool creates an
//! overflow handle instead of blocking the caller: availability is
//! preferred over a strict bound, because blocking under a retry storm
//! can deadlock the whole ingest path. Overflow handles are closed at
//! release when the free list is already full, so the pool drifts back
//! to `max_size` on its own.

use super::error::ResilienceError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use std::ops::{Deref, DerefMut};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for connection pool behavior.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Handles created at [`ConnectionPool::initialize`] and kept idle.
    pub max_size: usize,
    /// Attempts when constructing one handle (initialize, overflow,
    /// replacement all go through the same path).
    pub create_retries: u32,
    /// Cap for the exponential backoff between create attempts.
    pub create_backoff_cap: Duration,
    /// Deadline for one [`ConnectionPool::execute`] operation.
    pub execute_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 5,
            create_retries: 3,
            create_backoff_cap: Duration::from_secs(30),
            execute_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<(), ResilienceError> {
        if self.max_size == 0 {
            return Err(ResilienceError::InvalidConfig(
                "pool max_size must be > 0".to_string(),
            ));
        }
        if self.create_retries == 0 {
            return Err(ResilienceError::InvalidConfig(
                "pool create_retries must be > 0".to_string(),
            ));
        }
        if self.execute_timeout.is_zero() {
            return Err(ResilienceError::InvalidConfig(
                "pool execute_timeout must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// How calling clients construct, probe, and tear down their handles.
#[async_trait]
pub trait ConnectionFactory<T: Send + 'static>: Send + Sync {
    /// Create a new connection.
    async fn create(&self) -> Result<T, ResilienceError>;

    /// Check if a connection is still usable (e.g. ping).
    async fn is_healthy(&self, conn: &T) -> bool;

    /// Close a connection gracefully.
    async fn close(&self, conn: T) {
        drop(conn);
    }
}

/// An idle pooled handle.
struct PooledConnection<T> {
    conn: T,
    last_used: Instant,
}

struct PoolState<T> {
    idle: Vec<PooledConnection<T>>,
    active: usize,
    closed: bool,
}

struct PoolShared<T: Send + 'static> {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory<T>>,
    state: Mutex<PoolState<T>>,
}

/// Pool statistics for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub active: usize,
    pub total: usize,
    pub max_size: usize,
}

impl PoolStats {
    /// Checked-out share of the configured capacity. Can exceed 1.0
    /// while overflow handles are out.
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            return 0.0;
        }
        self.active as f64 / self.max_size as f64
    }
}

/// A checked-out connection. Deref to use it; hand it back with
/// [`ConnectionPool::release`]. Dropping the guard without releasing
/// (cancellation, panic unwind) frees the pool slot and lets the raw
/// handle close itself.
pub struct PoolGuard<T: Send + 'static> {
    conn: Option<T>,
    shared: Arc<PoolShared<T>>,
}

impl<T: Send + 'static> Deref for PoolGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.conn.as_ref().expect("connection present until release")
    }
}

impl<T: Send + 'static> DerefMut for PoolGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.conn.as_mut().expect("connection present until release")
    }
}

impl<T: Send + 'static> Drop for PoolGuard<T> {
    fn drop(&mut self) {
        let mut st = self.shared.state.lock().unwrap();
        st.active = st.active.saturating_sub(1);
        if let Some(conn) = self.conn.take() {
            drop(st);
            warn!("pooled connection dropped without release");
            drop(conn);
        }
    }
}

/// Bounded pool of expensive client handles (database clients, cache
/// clients) shared by all callers of one dependency.
///
/// # Example
///
/// ```no_run
/// use helios_core_resilience::{ConnectionPool, PoolConfig, ConnectionFactory, ResilienceError};
/// use async_trait::async_trait;
///
/// struct TsdbClient;
/// struct TsdbFactory;
///
/// #[async_trait]
/// impl ConnectionFactory<TsdbClient> for TsdbFactory {
///     async fn create(&self) -> Result<TsdbClient, ResilienceError> {
///         Ok(TsdbClient)
///     }
///     async fn is_healthy(&self, _conn: &TsdbClient) -> bool {
///         true
///     }
/// }
///
/// # async fn example() -> Result<(), ResilienceError> {
/// let pool = ConnectionPool::new(TsdbFactory, PoolConfig::default())?;
/// pool.initialize().await?;
/// let conn = pool.acquire().await?;
/// // use *conn ...
/// pool.release(conn).await;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool<T: Send + 'static> {
    shared: Arc<PoolShared<T>>,
}

impl<T: Send + 'static> Clone for ConnectionPool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> ConnectionPool<T> {
    pub fn new<F>(factory: F, config: PoolConfig) -> Result<Self, ResilienceError>
    where
        F: ConnectionFactory<T> + 'static,
    {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(PoolShared {
                config,
                factory: Arc::new(factory),
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    active: 0,
                    closed: false,
                }),
            }),
        })
    }

    /// Eagerly create and probe `max_size` handles.
    ///
    /// Any create or probe failure aborts initialization with the
    /// underlying cause: an unreachable dependency should stop the owning
    /// service's startup, not surface later as per-request errors.
    pub async fn initialize(&self) -> Result<(), ResilienceError> {
        for n in 0..self.shared.config.max_size {
            let conn = self.create_with_retry().await?;
            if !self.shared.factory.is_healthy(&conn).await {
                self.shared.factory.close(conn).await;
                return Err(ResilienceError::transient(format!(
                    "connection {n} failed its initial health probe"
                )));
            }
            let mut st = self.shared.state.lock().unwrap();
            if st.closed {
                drop(st);
                self.shared.factory.close(conn).await;
                return Err(ResilienceError::PoolClosed);
            }
            st.idle.push(PooledConnection {
                conn,
                last_used: Instant::now(),
            });
        }
        info!(size = self.shared.config.max_size, "connection pool initialized");
        Ok(())
    }

    /// Check out a handle, probing idle candidates and discarding any
    /// that fail.
    ///
    /// An empty free list creates an overflow handle past `max_size`
    /// instead of blocking; see the module docs for the trade-off.
    pub async fn acquire(&self) -> Result<PoolGuard<T>, ResilienceError> {
        loop {
            let candidate = {
                let mut st = self.shared.state.lock().unwrap();
                if st.closed {
                    return Err(ResilienceError::PoolClosed);
                }
                st.idle.pop()
            };

            match candidate {
                Some(pooled) => {
                    if self.shared.factory.is_healthy(&pooled.conn).await {
                        debug!(
                            idle_for = ?pooled.last_used.elapsed(),
                            "reusing idle connection"
                        );
                        return Ok(self.checkout(pooled.conn));
                    }
                    debug!("discarding idle connection that failed its health probe");
                    self.shared.factory.close(pooled.conn).await;
                }
                None => {
                    warn!("connection pool empty, creating overflow connection");
                    let conn = self.create_with_retry().await?;
                    return Ok(self.checkout(conn));
                }
            }
        }
    }

    fn checkout(&self, conn: T) -> PoolGuard<T> {
        self.shared.state.lock().unwrap().active += 1;
        PoolGuard {
            conn: Some(conn),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Return a handle. Healthy handles go back to the free list while
    /// it is below `max_size`; anything else is closed. An unhealthy
    /// handle additionally gets one best-effort replacement so the free
    /// list stays populated.
    pub async fn release(&self, mut guard: PoolGuard<T>) {
        let Some(conn) = guard.conn.take() else {
            return;
        };
        // Frees the active slot; the handle itself is settled below.
        drop(guard);

        if self.shared.factory.is_healthy(&conn).await {
            {
                let mut st = self.shared.state.lock().unwrap();
                if !st.closed && st.idle.len() < self.shared.config.max_size {
                    st.idle.push(PooledConnection {
                        conn,
                        last_used: Instant::now(),
                    });
                    return;
                }
            }
            // Pool full (overflow handle coming home) or shut down.
            self.shared.factory.close(conn).await;
            return;
        }

        debug!("connection failed its health probe at release, replacing");
        self.shared.factory.close(conn).await;

        let wants_replacement = {
            let st = self.shared.state.lock().unwrap();
            !st.closed && st.idle.len() < self.shared.config.max_size
        };
        if !wants_replacement {
            return;
        }
        match self.shared.factory.create().await {
            Ok(replacement) => {
                // The guard must be unconditionally dead before the close
                // await below or the returned future is not `Send`.
                let leftover = {
                    let mut st = self.shared.state.lock().unwrap();
                    if !st.closed && st.idle.len() < self.shared.config.max_size {
                        st.idle.push(PooledConnection {
                            conn: replacement,
                            last_used: Instant::now(),
                        });
                        None
                    } else {
                        Some(replacement)
                    }
                };
                if let Some(replacement) = leftover {
                    self.shared.factory.close(replacement).await;
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to replace unhealthy connection");
            }
        }
    }

    /// Run one operation against a checked-out handle and always hand the
    /// handle back, on success, error, timeout, and panic unwind alike.
    ///
    /// A hung operation is cut off after `execute_timeout` and surfaces
    /// as [`ResilienceError::Timeout`]; the handle still goes through the
    /// release probe, which decides whether it is reusable.
    pub async fn execute<R, F>(&self, op: F) -> Result<R, ResilienceError>
    where
        R: Send,
        F: for<'c> FnOnce(&'c mut T) -> BoxFuture<'c, Result<R, ResilienceError>>,
    {
        let deadline = self.shared.config.execute_timeout;
        let mut guard = self.acquire().await?;
        let outcome = AssertUnwindSafe(tokio::time::timeout(deadline, op(&mut *guard)))
            .catch_unwind()
            .await;
        self.release(guard).await;
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_elapsed)) => Err(ResilienceError::Timeout(deadline)),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Drain and close every idle handle. Idempotent; checked-out handles
    /// are closed when they come back through [`ConnectionPool::release`].
    pub async fn close(&self) {
        let drained = {
            let mut st = self.shared.state.lock().unwrap();
            st.closed = true;
            std::mem::take(&mut st.idle)
        };
        let drained_count = drained.len();
        for pooled in drained {
            self.shared.factory.close(pooled.conn).await;
        }
        if drained_count > 0 {
            info!(closed = drained_count, "connection pool closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().unwrap().closed
    }

    /// Point-in-time statistics for health reporting.
    pub fn stats(&self) -> PoolStats {
        let st = self.shared.state.lock().unwrap();
        PoolStats {
            idle: st.idle.len(),
            active: st.active,
            total: st.idle.len() + st.active,
            max_size: self.shared.config.max_size,
        }
    }

    /// Create one handle, retrying with capped exponential backoff and
    /// jitter. The last attempt's error propagates unchanged.
    async fn create_with_retry(&self) -> Result<T, ResilienceError> {
        let retries = self.shared.config.create_retries;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.shared.factory.create().await {
                Ok(conn) => return Ok(conn),
                Err(err) if attempt < retries => {
                    let exp = Duration::from_secs(2u64.saturating_pow(attempt));
                    let delay = exp
                        .min(self.shared.config.create_backoff_cap)
                        .mul_f64(rand::rng().random_range(0.9..1.1));
                    warn!(
                        attempt,
                        retries,
                        delay = ?delay,
                        error = %err,
                        "connection create failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
