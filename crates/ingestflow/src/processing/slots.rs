//! Bounded-concurrency slot pools
//!
//! One pool per downstream dependency class (documents, chunks, embeddings)
//! so that scheduler-level job parallelism cannot overload any single
//! dependency. Waiters are served in FIFO order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::SlotConfig;
use crate::error::{Error, Result};

/// Counting semaphore with FIFO waiters and an active-count gauge
pub struct SlotPool {
    name: &'static str,
    semaphore: Arc<Semaphore>,
    max: usize,
    active: Arc<AtomicUsize>,
    waiting: Arc<AtomicUsize>,
}

impl SlotPool {
    /// Create a pool with `max` concurrent slots
    pub fn new(name: &'static str, max: usize) -> Self {
        let max = max.max(1);
        Self {
            name,
            semaphore: Arc::new(Semaphore::new(max)),
            max,
            active: Arc::new(AtomicUsize::new(0)),
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Acquire a slot, waiting in FIFO order if none is free.
    ///
    /// The returned permit releases its slot on drop; the oldest waiter, if
    /// any, is granted immediately. Cancellation-safe: a dropped acquire
    /// leaves no trace in the gauges.
    pub async fn acquire(&self) -> Result<SlotPermit> {
        let _waiting = GaugeGuard::new(&self.waiting);
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal(format!("slot pool '{}' closed", self.name)))?;
        self.active.fetch_add(1, Ordering::SeqCst);

        Ok(SlotPermit {
            _permit: permit,
            active: Arc::clone(&self.active),
        })
    }

    /// Acquire a slot without waiting; `None` when the pool is saturated
    pub fn try_acquire(&self) -> Option<SlotPermit> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => {
                self.active.fetch_add(1, Ordering::SeqCst);
                Some(SlotPermit {
                    _permit: permit,
                    active: Arc::clone(&self.active),
                })
            }
            Err(_) => None,
        }
    }

    /// Pool name for logging
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Maximum concurrent slots
    pub fn max(&self) -> usize {
        self.max
    }

    /// Slots currently held
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Callers currently waiting for a slot
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}

/// Increments a gauge for its lifetime, decrementing on drop
struct GaugeGuard<'a> {
    gauge: &'a AtomicUsize,
}

impl<'a> GaugeGuard<'a> {
    fn new(gauge: &'a AtomicUsize) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self { gauge }
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::SeqCst);
    }
}

/// RAII slot handle; dropping it releases the slot to the oldest waiter
pub struct SlotPermit {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The three process-wide stage pools handed to running jobs
pub struct StagePools {
    /// Concurrent document extractions
    pub documents: SlotPool,
    /// Concurrent chunking operations
    pub chunks: SlotPool,
    /// Concurrent embedding requests
    pub embeddings: SlotPool,
}

impl StagePools {
    /// Build the stage pools from configuration
    pub fn new(config: &SlotConfig) -> Self {
        Self {
            documents: SlotPool::new("documents", config.document_slots),
            chunks: SlotPool::new("chunks", config.chunk_slots),
            embeddings: SlotPool::new("embeddings", config.embedding_slots),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_active_never_exceeds_max() {
        let pool = Arc::new(SlotPool::new("test", 2));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    let _permit = pool.acquire().await.unwrap();
                    peak.fetch_max(pool.active(), Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.active(), 0);
    }

    #[tokio::test]
    async fn test_release_wakes_oldest_waiter_first() {
        let pool = Arc::new(SlotPool::new("fifo", 1));
        let first = pool.acquire().await.unwrap();

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let pool = Arc::clone(&pool);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _permit = pool.acquire().await.unwrap();
                order.lock().push(i);
            }));
            // Let each waiter enqueue before the next
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(pool.waiting(), 3);
        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_try_acquire_when_saturated() {
        let pool = SlotPool::new("try", 1);
        let held = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());
        drop(held);
        assert!(pool.try_acquire().is_some());
    }
}
