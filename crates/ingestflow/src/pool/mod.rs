//! Adaptive connection pool gating calls to the external vector store
//!
//! Bounds concurrent calls with FIFO waiters, races every call against a hard
//! timeout, and feeds outcomes into a circuit breaker. The connection limit
//! adapts to utilization between a floor and a ceiling; a periodic health
//! probe exercises the dependency independent of request traffic.

mod breaker;

pub use breaker::{BreakerState, CircuitBreaker};

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::PoolConfig;
use crate::error::{Error, Result};

struct PoolState {
    max_connections: usize,
    active: usize,
    next_waiter_id: u64,
    waiters: VecDeque<(u64, oneshot::Sender<()>)>,
}

impl PoolState {
    /// Hand freed or newly added capacity to the oldest live waiters.
    ///
    /// Timed-out waiters deregister themselves under this same lock, so a
    /// successful send always has a caller on the other end accepting the
    /// slot. A send failure means the acquire future itself was dropped.
    fn grant_waiters(&mut self) {
        while self.active < self.max_connections {
            match self.waiters.pop_front() {
                Some((_, tx)) => {
                    if tx.send(()).is_ok() {
                        self.active += 1;
                    }
                }
                None => break,
            }
        }
    }
}

#[derive(Default)]
struct MetricsInner {
    requests: u64,
    successes: u64,
    failures: u64,
    timeouts: u64,
    breaker_rejections: u64,
    acquire_timeouts: u64,
    total_latency_ms: u64,
    peak_active: usize,
}

struct PoolShared {
    config: PoolConfig,
    breaker: CircuitBreaker,
    state: Mutex<PoolState>,
    metrics: Mutex<MetricsInner>,
}

/// RAII connection slot; dropping it releases the slot to the oldest waiter
struct PoolSlot {
    shared: Arc<PoolShared>,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        let state = &mut *self.shared.state.lock();
        state.active = state.active.saturating_sub(1);
        state.grant_waiters();
    }
}

/// Connection pool with adaptive sizing and circuit breaking
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let breaker = CircuitBreaker::new(
            config.failure_threshold,
            config.success_threshold,
            config.recovery_timeout(),
        );
        let initial = config
            .initial_connections
            .clamp(config.min_connections.max(1), config.max_connections.max(1));
        let (shutdown, _) = watch::channel(false);

        Self {
            shared: Arc::new(PoolShared {
                config,
                breaker,
                state: Mutex::new(PoolState {
                    max_connections: initial,
                    active: 0,
                    next_waiter_id: 0,
                    waiters: VecDeque::new(),
                }),
                metrics: Mutex::new(MetricsInner::default()),
            }),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Execute an operation through the pool.
    ///
    /// Fails fast with `Error::CircuitOpen` while the breaker is open;
    /// otherwise acquires a slot (FIFO, bounded wait), races the operation
    /// against the call timeout, and releases the slot on every exit path.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Err(e) = self.shared.breaker.check() {
            self.shared.metrics.lock().breaker_rejections += 1;
            return Err(e);
        }

        let slot = self.acquire_slot().await?;
        let active = self.shared.state.lock().active;
        {
            let metrics = &mut *self.shared.metrics.lock();
            metrics.requests += 1;
            metrics.peak_active = metrics.peak_active.max(active);
        }

        let start = Instant::now();
        let result = tokio::time::timeout(self.shared.config.call_timeout(), op()).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        drop(slot);

        match result {
            Ok(Ok(value)) => {
                self.shared.breaker.record_success();
                let metrics = &mut *self.shared.metrics.lock();
                metrics.successes += 1;
                metrics.total_latency_ms += elapsed_ms;
                Ok(value)
            }
            Ok(Err(e)) => {
                self.shared.breaker.record_failure();
                self.shared.metrics.lock().failures += 1;
                Err(e)
            }
            Err(_) => {
                self.shared.breaker.record_failure();
                let metrics = &mut *self.shared.metrics.lock();
                metrics.failures += 1;
                metrics.timeouts += 1;
                Err(Error::Timeout(format!(
                    "vector store call exceeded {}ms",
                    self.shared.config.call_timeout_ms
                )))
            }
        }
    }

    /// Spawn the adaptive-resize task; stopped by `shutdown`
    pub fn start_maintenance(&self) {
        let shared = Arc::clone(&self.shared);
        let mut shutdown = self.shutdown.subscribe();
        let interval = std::time::Duration::from_secs(self.shared.config.resize_interval_secs.max(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = ticker.tick() => Self::resize_once(&shared),
                    _ = shutdown.changed() => break,
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Spawn the health-probe task; probe failures feed the breaker even when
    /// no request traffic is flowing
    pub fn start_health_probe<F, Fut>(&self, probe: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        if self.shared.config.health_interval_secs == 0 {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let mut shutdown = self.shutdown.subscribe();
        let interval = std::time::Duration::from_secs(self.shared.config.health_interval_secs);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match probe().await {
                            Ok(true) => {
                                // Probe successes only count toward recovery
                                if shared.breaker.state() == BreakerState::HalfOpen {
                                    shared.breaker.record_success();
                                }
                            }
                            Ok(false) => {
                                tracing::warn!("Health probe reported unhealthy dependency");
                                shared.breaker.record_failure();
                            }
                            Err(e) => {
                                tracing::warn!("Health probe failed: {}", e);
                                shared.breaker.record_failure();
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Stop maintenance and probe tasks
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Metrics and state snapshot
    pub fn metrics(&self) -> PoolMetrics {
        let (max_connections, active, waiting) = {
            let state = self.shared.state.lock();
            (state.max_connections, state.active, state.waiters.len())
        };
        let metrics = self.shared.metrics.lock();
        PoolMetrics {
            max_connections,
            active,
            waiting,
            requests: metrics.requests,
            successes: metrics.successes,
            failures: metrics.failures,
            timeouts: metrics.timeouts,
            breaker_rejections: metrics.breaker_rejections,
            acquire_timeouts: metrics.acquire_timeouts,
            peak_active: metrics.peak_active,
            avg_latency_ms: if metrics.successes > 0 {
                metrics.total_latency_ms / metrics.successes
            } else {
                0
            },
            breaker_state: self.shared.breaker.state(),
            breaker_failures: self.shared.breaker.failures(),
        }
    }

    /// Breaker handle, for callers that want to observe state transitions
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.shared.breaker
    }

    async fn acquire_slot(&self) -> Result<PoolSlot> {
        let (waiter_id, mut rx) = {
            let state = &mut *self.shared.state.lock();
            if state.active < state.max_connections {
                state.active += 1;
                return Ok(PoolSlot {
                    shared: Arc::clone(&self.shared),
                });
            }
            let (tx, rx) = oneshot::channel();
            let waiter_id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiters.push_back((waiter_id, tx));
            (waiter_id, rx)
        };

        let deadline = tokio::time::sleep(self.shared.config.acquire_timeout());
        tokio::pin!(deadline);

        tokio::select! {
            res = &mut rx => match res {
                Ok(()) => Ok(PoolSlot { shared: Arc::clone(&self.shared) }),
                Err(_) => Err(Error::Internal("connection pool waiter dropped".into())),
            },
            _ = &mut deadline => {
                // Grant and timeout race; the state lock serializes them.
                // Either the grant already landed (take the slot), or this
                // waiter is deregistered so no later grant can bump `active`
                // without a holder on the other end.
                let granted = {
                    let state = &mut *self.shared.state.lock();
                    match rx.try_recv() {
                        Ok(()) => true,
                        _ => {
                            state.waiters.retain(|(id, _)| *id != waiter_id);
                            false
                        }
                    }
                };
                if granted {
                    Ok(PoolSlot { shared: Arc::clone(&self.shared) })
                } else {
                    self.shared.metrics.lock().acquire_timeouts += 1;
                    Err(Error::Timeout(format!(
                        "timed out after {}ms waiting for a connection slot",
                        self.shared.config.acquire_timeout_ms
                    )))
                }
            }
        }
    }

    /// One adaptive-sizing pass: grow under pressure, shrink when idle.
    ///
    /// Shrinking only lowers the admission limit; held slots are never
    /// revoked.
    fn resize_once(shared: &Arc<PoolShared>) {
        let state = &mut *shared.state.lock();
        let utilization = state.active as f64 / state.max_connections.max(1) as f64;
        let config = &shared.config;

        if (utilization > config.scale_up_threshold || !state.waiters.is_empty())
            && state.max_connections < config.max_connections
        {
            state.max_connections += 1;
            tracing::info!(
                "Connection pool scaled up to {} (utilization {:.0}%, {} waiting)",
                state.max_connections,
                utilization * 100.0,
                state.waiters.len()
            );
            state.grant_waiters();
        } else if utilization < config.scale_down_threshold
            && state.waiters.is_empty()
            && state.max_connections > config.min_connections
        {
            state.max_connections -= 1;
            tracing::debug!(
                "Connection pool scaled down to {} (utilization {:.0}%)",
                state.max_connections,
                utilization * 100.0
            );
        }
    }
}

/// Pool metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub max_connections: usize,
    pub active: usize,
    pub waiting: usize,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub breaker_rejections: u64,
    pub acquire_timeouts: u64,
    pub peak_active: usize,
    pub avg_latency_ms: u64,
    pub breaker_state: BreakerState,
    pub breaker_failures: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_config() -> PoolConfig {
        PoolConfig {
            initial_connections: 2,
            min_connections: 1,
            max_connections: 4,
            acquire_timeout_ms: 200,
            call_timeout_ms: 200,
            failure_threshold: 3,
            success_threshold: 1,
            recovery_timeout_secs: 30,
            resize_interval_secs: 1,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            health_interval_secs: 0,
        }
    }

    #[tokio::test]
    async fn test_successful_call_records_metrics() {
        let pool = ConnectionPool::new(test_config());
        let result: i32 = pool.execute(|| async { Ok(41 + 1) }).await.unwrap();
        assert_eq!(result, 42);

        let metrics = pool.metrics();
        assert_eq!(metrics.requests, 1);
        assert_eq!(metrics.successes, 1);
        assert_eq!(metrics.active, 0);
    }

    #[tokio::test]
    async fn test_breaker_opens_and_fails_fast() {
        let pool = ConnectionPool::new(test_config());
        let invocations = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let invocations = Arc::clone(&invocations);
            let result: Result<()> = pool
                .execute(move || async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Store("connection refused".into()))
                })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(pool.metrics().breaker_state, BreakerState::Open);

        // The 4th call fails fast without touching the dependency
        let invocations_before = invocations.load(Ordering::SeqCst);
        let result: Result<()> = pool
            .execute({
                let invocations = Arc::clone(&invocations);
                move || async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        assert!(matches!(result, Err(Error::CircuitOpen(_))));
        assert_eq!(invocations.load(Ordering::SeqCst), invocations_before);
        assert_eq!(pool.metrics().breaker_rejections, 1);
    }

    #[tokio::test]
    async fn test_call_timeout_counts_as_failure() {
        let pool = ConnectionPool::new(test_config());
        let result: Result<()> = pool
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));

        let metrics = pool.metrics();
        assert_eq!(metrics.timeouts, 1);
        assert_eq!(metrics.breaker_failures, 1);
        // The slot was released despite the timeout
        assert_eq!(metrics.active, 0);
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_limit() {
        let pool = Arc::new(ConnectionPool::new(test_config()));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    pool.execute(move || async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_acquire_timeout_when_saturated() {
        let mut config = test_config();
        config.initial_connections = 1;
        config.acquire_timeout_ms = 50;
        config.call_timeout_ms = 5_000;
        let pool = Arc::new(ConnectionPool::new(config));

        let holder = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.execute(|| async {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(())
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result: Result<()> = pool.execute(|| async { Ok(()) }).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(pool.metrics().acquire_timeouts, 1);

        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_timed_out_waiter_leaves_no_trace() {
        let mut config = test_config();
        config.initial_connections = 1;
        config.acquire_timeout_ms = 30;
        let pool = ConnectionPool::new(config);

        let held = pool.acquire_slot().await.unwrap();
        let result = pool.acquire_slot().await;
        assert!(matches!(result, Err(Error::Timeout(_))));

        // Giving up deregisters the waiter: nothing queued, no phantom
        // active slot, and adaptive sizing sees no demand.
        let metrics = pool.metrics();
        assert_eq!(metrics.waiting, 0);
        assert_eq!(metrics.active, 1);
        assert_eq!(metrics.acquire_timeouts, 1);

        // The freed slot goes to a real caller, and the count drops to zero
        drop(held);
        assert_eq!(pool.metrics().active, 0);
        let result: Result<()> = pool.execute(|| async { Ok(()) }).await;
        assert!(result.is_ok());
        assert_eq!(pool.metrics().active, 0);
    }

    #[tokio::test]
    async fn test_adaptive_resize_bounds() {
        let pool = ConnectionPool::new(test_config());

        // Saturate: hold both slots, then resize under pressure
        let mut held = Vec::new();
        held.push(pool.acquire_slot().await.unwrap());
        held.push(pool.acquire_slot().await.unwrap());
        ConnectionPool::resize_once(&pool.shared);
        assert_eq!(pool.metrics().max_connections, 3);

        // Keep the pool fully utilized and the ceiling still holds
        held.push(pool.acquire_slot().await.unwrap());
        for _ in 0..10 {
            ConnectionPool::resize_once(&pool.shared);
            if pool.metrics().active < pool.metrics().max_connections {
                break;
            }
            held.push(pool.acquire_slot().await.unwrap());
        }
        assert_eq!(pool.metrics().max_connections, 4);

        // Idle: shrink back down to the floor, never below
        held.clear();
        for _ in 0..10 {
            ConnectionPool::resize_once(&pool.shared);
        }
        assert_eq!(pool.metrics().max_connections, 1);
    }
}
