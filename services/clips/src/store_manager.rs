//! Store handle manager.
//!
//! Owns the long-lived pool for the backing store and hands every request an
//! exclusively-owned, liveness-checked handle. A store that cannot be reached
//! at startup leaves the manager in degraded mode instead of failing the
//! process; each acquisition retries initialization once before giving up
//! with [`StoreError::NotReady`].

use crate::retry::RetryPolicy;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use parking_lot::RwLock;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Errors surfaced by handle acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Store not initialized: {last_error}")]
    NotReady { last_error: String },

    #[error("Store unavailable after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

/// Integration point for a concrete store driver.
///
/// `Pool` is the long-lived engine descriptor built once per process, `Conn`
/// a single connection checked out of it.
#[async_trait]
pub trait StoreDriver: Send + Sync + 'static {
    type Pool: Clone + Send + Sync + 'static;
    type Conn: Send + 'static;

    /// Build the pool from an opaque connection descriptor.
    async fn connect(&self, descriptor: &str) -> Result<Self::Pool>;

    /// Prepare a freshly built pool before it serves requests.
    async fn on_ready(&self, _pool: &Self::Pool) -> Result<()> {
        Ok(())
    }

    /// Check a connection out of the pool.
    async fn open(&self, pool: &Self::Pool) -> Result<Self::Conn>;

    /// Minimal no-op round trip proving the connection is usable.
    async fn ping(&self, conn: &mut Self::Conn) -> Result<()>;

    /// Throw away a connection that failed its probe.
    async fn discard(&self, conn: Self::Conn) {
        drop(conn);
    }

    /// Shut the pool down, waiting for checked-out connections to return.
    async fn close(&self, pool: Self::Pool) {
        drop(pool);
    }
}

/// Externally visible readiness of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreStatus {
    Uninitialized,
    Ready,
    Degraded { last_error: String },
}

enum EngineState<P> {
    Uninitialized,
    Ready(P),
    Degraded { last_error: String },
}

#[derive(Debug, Default)]
struct StoreCounters {
    attempts: AtomicU64,
    failures: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
}

/// Point-in-time copy of the acquisition counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub attempts: u64,
    pub failures: u64,
    pub acquired: u64,
    pub released: u64,
}

/// Hands out store handles with bounded retry.
pub struct StoreManager<D: StoreDriver> {
    driver: D,
    descriptor: String,
    policy: RetryPolicy,
    state: RwLock<EngineState<D::Pool>>,
    counters: Arc<StoreCounters>,
}

impl<D: StoreDriver> StoreManager<D> {
    /// Create an uninitialized manager; call [`initialize`](Self::initialize) at startup.
    pub fn new(driver: D, descriptor: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            driver,
            descriptor: descriptor.into(),
            policy,
            state: RwLock::new(EngineState::Uninitialized),
            counters: Arc::new(StoreCounters::default()),
        }
    }

    /// Build the pool. Failure is recorded, never propagated.
    ///
    /// Returns whether the store is ready afterwards.
    pub async fn initialize(&self) -> bool {
        let started = Instant::now();

        let pool = match self.driver.connect(&self.descriptor).await {
            Ok(pool) => pool,
            Err(e) => return self.record_init_failure(e, started),
        };

        if let Err(e) = self.driver.on_ready(&pool).await {
            return self.record_init_failure(e, started);
        }

        let mut state = self.state.write();
        if matches!(*state, EngineState::Ready(_)) {
            // Another caller won the race; keep its pool.
            debug!("Store already initialized, dropping concurrently built pool");
        } else {
            *state = EngineState::Ready(pool);
            info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Store initialized"
            );
        }
        true
    }

    fn record_init_failure(&self, e: anyhow::Error, started: Instant) -> bool {
        let last_error = format!("{e:#}");
        error!(
            error = %last_error,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Store initialization failed, running in degraded mode"
        );
        metrics::counter!("clips_store_init_failures_total").increment(1);

        let mut state = self.state.write();
        if matches!(*state, EngineState::Ready(_)) {
            return true;
        }
        *state = EngineState::Degraded { last_error };
        false
    }

    /// Acquire a live handle, retrying per the policy.
    pub async fn acquire(&self) -> Result<StoreHandle<D::Conn>, StoreError> {
        let pool = match self.pool() {
            Some(pool) => pool,
            None => {
                warn!("Store not ready, attempting re-initialization");
                self.initialize().await;
                self.pool().ok_or_else(|| StoreError::NotReady {
                    last_error: self.last_error(),
                })?
            }
        };

        let started = Instant::now();
        let mut backoff = self.policy.backoff();
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.counters.attempts.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("clips_store_acquire_attempts_total").increment(1);

            let error = match self.open_checked(&pool).await {
                Ok(conn) => {
                    self.counters.acquired.fetch_add(1, Ordering::Relaxed);
                    if attempt > 1 {
                        info!(attempt = attempt, "Store handle acquired after retry");
                    }
                    return Ok(StoreHandle::new(conn, self.counters.clone()));
                }
                Err(e) => format!("{e:#}"),
            };

            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("clips_store_acquire_failures_total").increment(1);

            if let Some(delay) = backoff.next_backoff() {
                warn!(
                    attempt = attempt,
                    max_attempts = self.policy.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Store handle acquisition failed, retrying"
                );
                tokio::time::sleep(delay).await;
            } else {
                error!(
                    attempts = attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %error,
                    "Store handle acquisition exhausted"
                );
                return Err(StoreError::Exhausted {
                    attempts: attempt,
                    last_error: error,
                });
            }
        }
    }

    /// One attempt: open and probe, each bounded by the probe timeout.
    async fn open_checked(&self, pool: &D::Pool) -> Result<D::Conn> {
        let limit = self.policy.probe_timeout();

        let mut conn = match timeout(limit, self.driver.open(pool)).await {
            Ok(conn) => conn?,
            Err(_) => bail!(
                "Opening a connection timed out after {}ms",
                limit.as_millis()
            ),
        };

        let probe = match timeout(limit, self.driver.ping(&mut conn)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "Liveness probe timed out after {}ms",
                limit.as_millis()
            )),
        };

        match probe {
            Ok(()) => Ok(conn),
            Err(e) => {
                self.driver.discard(conn).await;
                Err(e)
            }
        }
    }

    fn pool(&self) -> Option<D::Pool> {
        match &*self.state.read() {
            EngineState::Ready(pool) => Some(pool.clone()),
            _ => None,
        }
    }

    fn last_error(&self) -> String {
        match &*self.state.read() {
            EngineState::Degraded { last_error } => last_error.clone(),
            EngineState::Uninitialized => "store was never initialized".to_string(),
            EngineState::Ready(_) => String::new(),
        }
    }

    /// Current readiness
    pub fn status(&self) -> StoreStatus {
        match &*self.state.read() {
            EngineState::Uninitialized => StoreStatus::Uninitialized,
            EngineState::Ready(_) => StoreStatus::Ready,
            EngineState::Degraded { last_error } => StoreStatus::Degraded {
                last_error: last_error.clone(),
            },
        }
    }

    /// Acquisition counters
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            attempts: self.counters.attempts.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
        }
    }

    /// Retry policy in use
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Close the pool at shutdown. Later acquisitions re-initialize.
    pub async fn shutdown(&self) {
        let previous =
            std::mem::replace(&mut *self.state.write(), EngineState::Uninitialized);
        if let EngineState::Ready(pool) = previous {
            self.driver.close(pool).await;
            info!("Store pool closed");
        }
    }
}

/// Exclusively-owned connection for one request.
///
/// Released when dropped, on every exit path including cancellation. Callers
/// mutate inside a transaction begun on the handle; a transaction that is not
/// committed rolls back when it goes out of scope, before the connection
/// returns to the pool.
pub struct StoreHandle<C> {
    conn: C,
    acquired_at: Instant,
    counters: Arc<StoreCounters>,
}

impl<C> StoreHandle<C> {
    fn new(conn: C, counters: Arc<StoreCounters>) -> Self {
        Self {
            conn,
            acquired_at: Instant::now(),
            counters,
        }
    }

    /// Time since acquisition
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl<C> std::fmt::Debug for StoreHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("held_for", &self.held_for())
            .finish_non_exhaustive()
    }
}

impl<C> Deref for StoreHandle<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> DerefMut for StoreHandle<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

impl<C> Drop for StoreHandle<C> {
    fn drop(&mut self) {
        self.counters.released.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("clips_store_handles_released_total").increment(1);
        debug!(
            held_ms = self.held_for().as_millis() as u64,
            "Store handle released"
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use tokio_test::{assert_err, assert_ok};

    /// Connection that reports its own release
    pub(crate) struct FakeConn {
        pub(crate) id: u64,
        dropped: Arc<AtomicU64>,
    }

    impl Drop for FakeConn {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Scriptable in-memory driver
    #[derive(Default)]
    pub(crate) struct FakeDriver {
        pub(crate) connect_failures: AtomicU32,
        pub(crate) connect_always_fails: AtomicBool,
        pub(crate) ping_failures: AtomicU32,
        pub(crate) ping_always_fails: AtomicBool,
        pub(crate) ping_hangs: AtomicBool,
        pub(crate) connects: AtomicU32,
        pub(crate) pings: AtomicU32,
        pub(crate) closed: AtomicU32,
        pub(crate) opened: AtomicU64,
        pub(crate) dropped: Arc<AtomicU64>,
    }

    impl FakeDriver {
        pub(crate) fn healthy() -> Self {
            Self::default()
        }

        pub(crate) fn failing_pings(count: u32) -> Self {
            let driver = Self::default();
            driver.ping_failures.store(count, Ordering::SeqCst);
            driver
        }

        pub(crate) fn unreachable() -> Self {
            let driver = Self::default();
            driver.connect_always_fails.store(true, Ordering::SeqCst);
            driver
        }
    }

    #[async_trait]
    impl StoreDriver for FakeDriver {
        type Pool = ();
        type Conn = FakeConn;

        async fn connect(&self, _descriptor: &str) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.connect_always_fails.load(Ordering::SeqCst) {
                return Err(anyhow!("connection refused"));
            }
            let remaining = self.connect_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.connect_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(anyhow!("connection refused"));
            }
            Ok(())
        }

        async fn close(&self, _pool: ()) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        async fn open(&self, _pool: &()) -> Result<FakeConn> {
            let id = self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(FakeConn {
                id,
                dropped: self.dropped.clone(),
            })
        }

        async fn ping(&self, _conn: &mut FakeConn) -> Result<()> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            if self.ping_hangs.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.ping_always_fails.load(Ordering::SeqCst) {
                return Err(anyhow!("server closed the connection unexpectedly"));
            }
            let remaining = self.ping_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.ping_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(anyhow!("server closed the connection unexpectedly"));
            }
            Ok(())
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    async fn ready_manager(driver: FakeDriver) -> StoreManager<FakeDriver> {
        let manager = StoreManager::new(driver, "postgresql://localhost/clips", fast_policy());
        assert!(manager.initialize().await);
        manager
    }

    #[tokio::test]
    async fn test_probe_recovers_before_retries_exhausted() {
        let manager = ready_manager(FakeDriver::failing_pings(2)).await;

        let handle = assert_ok!(manager.acquire().await);
        assert_eq!(handle.id, 2);

        let stats = manager.stats();
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.failures, 2);
        assert_eq!(manager.driver.pings.load(Ordering::SeqCst), 3);
        // Both failed connections were discarded.
        assert_eq!(manager.driver.dropped.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_probe_always_failing_exhausts_after_max_attempts() {
        let driver = FakeDriver::healthy();
        driver.ping_always_fails.store(true, Ordering::SeqCst);
        let manager = ready_manager(driver).await;

        let err = assert_err!(manager.acquire().await);
        match err {
            StoreError::Exhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("closed the connection"));
            }
            other => panic!("Expected Exhausted, got {:?}", other),
        }
        assert_eq!(manager.driver.pings.load(Ordering::SeqCst), 3);
        assert_eq!(manager.stats().acquired, 0);
        assert_eq!(manager.driver.dropped.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_handle_released_on_drop() {
        let manager = ready_manager(FakeDriver::healthy()).await;

        {
            let _handle = assert_ok!(manager.acquire().await);
            assert_eq!(manager.stats().released, 0);
        }

        assert_eq!(manager.stats().acquired, 1);
        assert_eq!(manager.stats().released, 1);
        assert_eq!(manager.driver.dropped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_degraded_start_recovers_on_acquire() {
        let driver = FakeDriver::healthy();
        driver.connect_failures.store(1, Ordering::SeqCst);
        let manager = StoreManager::new(driver, "postgresql://localhost/clips", fast_policy());

        assert!(!manager.initialize().await);
        assert!(matches!(manager.status(), StoreStatus::Degraded { .. }));

        assert_ok!(manager.acquire().await);
        assert_eq!(manager.status(), StoreStatus::Ready);
        assert_eq!(manager.driver.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_fast() {
        let manager = StoreManager::new(
            FakeDriver::unreachable(),
            "postgresql://localhost/clips",
            fast_policy(),
        );
        assert!(!manager.initialize().await);

        let err = assert_err!(manager.acquire().await);
        match err {
            StoreError::NotReady { last_error } => {
                assert!(last_error.contains("connection refused"));
            }
            other => panic!("Expected NotReady, got {:?}", other),
        }
        // Startup attempt plus exactly one re-initialization.
        assert_eq!(manager.driver.connects.load(Ordering::SeqCst), 2);
        assert_eq!(manager.stats().attempts, 0);
    }

    #[tokio::test]
    async fn test_cancelled_acquire_releases_connection() {
        let driver = FakeDriver::healthy();
        driver.ping_hangs.store(true, Ordering::SeqCst);
        let manager = ready_manager(driver).await;

        let result =
            tokio::time::timeout(Duration::from_millis(20), manager.acquire()).await;
        assert!(result.is_err());

        let opened = manager.driver.opened.load(Ordering::SeqCst);
        assert_eq!(opened, 1);
        assert_eq!(manager.driver.dropped.load(Ordering::SeqCst), opened);
    }

    #[tokio::test]
    async fn test_concurrent_handles_are_exclusive() {
        let manager = Arc::new(ready_manager(FakeDriver::healthy()).await);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                let handle = manager.acquire().await.map_err(|e| e.to_string())?;
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<u64, String>(handle.id)
            }));
        }

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().unwrap());
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 8);
        assert_eq!(manager.stats().released, 8);
    }

    #[tokio::test]
    async fn test_hanging_probe_times_out_and_retries() {
        let driver = FakeDriver::healthy();
        driver.ping_hangs.store(true, Ordering::SeqCst);
        let manager = StoreManager::new(
            driver,
            "postgresql://localhost/clips",
            fast_policy().with_probe_timeout(Duration::from_millis(10)),
        );
        assert!(manager.initialize().await);

        let result = tokio::time::timeout(Duration::from_secs(5), manager.acquire()).await;
        let err = assert_err!(result.expect("acquire must finish on its own"));
        match err {
            StoreError::Exhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("timed out"));
            }
            other => panic!("Expected Exhausted, got {:?}", other),
        }

        assert_eq!(manager.driver.pings.load(Ordering::SeqCst), 3);
        // Every timed-out connection was discarded.
        assert_eq!(manager.driver.dropped.load(Ordering::SeqCst), 3);
        assert_eq!(manager.stats().failures, 3);
    }

    #[tokio::test]
    async fn test_shutdown_closes_pool() {
        let manager = ready_manager(FakeDriver::healthy()).await;

        manager.shutdown().await;
        assert_eq!(manager.status(), StoreStatus::Uninitialized);
        assert_eq!(manager.driver.closed.load(Ordering::SeqCst), 1);

        // Nothing left to close.
        manager.shutdown().await;
        assert_eq!(manager.driver.closed.load(Ordering::SeqCst), 1);
    }
}
