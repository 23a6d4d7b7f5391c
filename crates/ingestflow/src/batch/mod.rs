//! Embedding batch collector
//!
//! Accumulates embedding requests into time-windowed batches: inputs are
//! normalized, probed against the shared cache by content hash, deduplicated
//! within the call, and dispatched in fixed-size batches through an internal
//! FIFO drained on a timer. Batch executions retry with linear backoff;
//! fresh results are written back into the cache.

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::cache::{content_hash, ResourceCache};
use crate::config::BatchConfig;
use crate::error::{Error, Result};
use crate::processing::SlotPool;
use crate::providers::EmbeddingProvider;

struct PendingBatch {
    texts: Vec<String>,
    hashes: Vec<String>,
    tx: oneshot::Sender<Result<Vec<Vec<f32>>>>,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    deduped: AtomicU64,
    batches: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
    texts_embedded: AtomicU64,
}

struct BatchShared {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<ResourceCache<Vec<f32>>>,
    config: BatchConfig,
    queue: Mutex<VecDeque<PendingBatch>>,
    slots: SlotPool,
    counters: Counters,
}

/// Time-windowed, deduplicating embedding batcher
pub struct BatchCollector {
    shared: Arc<BatchShared>,
    shutdown: watch::Sender<bool>,
    drain_task: Mutex<Option<JoinHandle<()>>>,
}

impl BatchCollector {
    /// Create a collector; call `start` to begin draining queued batches
    pub fn new(
        config: BatchConfig,
        provider: Arc<dyn EmbeddingProvider>,
        cache: Arc<ResourceCache<Vec<f32>>>,
    ) -> Self {
        let slots = SlotPool::new("embedding-batches", config.max_concurrent_batches);
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(BatchShared {
                provider,
                cache,
                config,
                queue: Mutex::new(VecDeque::new()),
                slots,
                counters: Counters::default(),
            }),
            shutdown,
            drain_task: Mutex::new(None),
        }
    }

    /// Spawn the batch-window drain task
    pub fn start(&self) {
        let shared = Arc::clone(&self.shared);
        let mut shutdown = self.shutdown.subscribe();
        let window = self.shared.config.batch_window();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(window);
            ticker.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = ticker.tick() => BatchShared::drain(&shared),
                    _ = shutdown.changed() => {
                        BatchShared::drain(&shared);
                        break;
                    }
                }
            }
        });
        *self.drain_task.lock() = Some(handle);
    }

    /// Embed a slice of texts, preserving input order.
    ///
    /// Duplicate texts within the call are computed once; cached results are
    /// served without touching the provider. Resolves once all of the call's
    /// batches have completed (or any batch exhausts its retries).
    pub async fn process(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let normalized: Vec<String> = texts
            .iter()
            .map(|t| normalize(t, self.shared.config.min_text_len, self.shared.config.max_text_len))
            .collect();
        let hashes: Vec<String> = normalized.iter().map(|t| content_hash(t)).collect();

        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut uncached: Vec<usize> = Vec::new();
        for (i, hash) in hashes.iter().enumerate() {
            match self.shared.cache.get(hash) {
                Some(vector) => {
                    self.shared.counters.hits.fetch_add(1, Ordering::Relaxed);
                    results[i] = Some(vector);
                }
                None => {
                    self.shared.counters.misses.fetch_add(1, Ordering::Relaxed);
                    uncached.push(i);
                }
            }
        }

        if !uncached.is_empty() {
            // Deduplicate identical texts within the call; every duplicate
            // position maps back to one computed slot.
            let mut unique_texts: Vec<String> = Vec::new();
            let mut unique_hashes: Vec<String> = Vec::new();
            let mut slot_positions: Vec<Vec<usize>> = Vec::new();
            let mut slot_by_hash: HashMap<String, usize> = HashMap::new();
            for &i in &uncached {
                match slot_by_hash.get(&hashes[i]) {
                    Some(&slot) => {
                        slot_positions[slot].push(i);
                        self.shared.counters.deduped.fetch_add(1, Ordering::Relaxed);
                    }
                    None => {
                        slot_by_hash.insert(hashes[i].clone(), unique_texts.len());
                        slot_positions.push(vec![i]);
                        unique_texts.push(normalized[i].clone());
                        unique_hashes.push(hashes[i].clone());
                    }
                }
            }

            // Split into fixed-size batches on the shared FIFO
            let batch_size = self.shared.config.batch_size.max(1);
            let mut receivers = Vec::new();
            {
                let mut queue = self.shared.queue.lock();
                let mut start = 0;
                while start < unique_texts.len() {
                    let end = (start + batch_size).min(unique_texts.len());
                    let (tx, rx) = oneshot::channel();
                    queue.push_back(PendingBatch {
                        texts: unique_texts[start..end].to_vec(),
                        hashes: unique_hashes[start..end].to_vec(),
                        tx,
                    });
                    receivers.push((start..end, rx));
                    start = end;
                }
            }

            let (ranges, rxs): (Vec<_>, Vec<_>) = receivers.into_iter().unzip();
            let outcomes = join_all(rxs).await;
            for (slots, outcome) in ranges.into_iter().zip(outcomes) {
                let vectors = match outcome {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(Error::Internal(
                            "embedding batch was dropped before completion".into(),
                        ))
                    }
                };
                if vectors.len() != slots.len() {
                    return Err(Error::Embedding(format!(
                        "provider returned {} vectors for {} texts",
                        vectors.len(),
                        slots.len()
                    )));
                }
                for (offset, slot) in slots.enumerate() {
                    for &pos in &slot_positions[slot] {
                        results[pos] = Some(vectors[offset].clone());
                    }
                }
            }
        }

        results
            .into_iter()
            .map(|r| r.ok_or_else(|| Error::Internal("missing embedding result".into())))
            .collect()
    }

    /// Dispatch queued batches immediately instead of waiting for the window
    pub fn flush(&self) {
        BatchShared::drain(&self.shared);
    }

    /// Drain outstanding work and stop the window task
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.drain_task.lock().take() {
            let _ = handle.await;
        }
    }

    /// Metrics snapshot
    pub fn metrics(&self) -> BatchMetrics {
        let counters = &self.shared.counters;
        let batches = counters.batches.load(Ordering::Relaxed);
        let texts = counters.texts_embedded.load(Ordering::Relaxed);
        BatchMetrics {
            cache_hits: counters.hits.load(Ordering::Relaxed),
            cache_misses: counters.misses.load(Ordering::Relaxed),
            deduplicated: counters.deduped.load(Ordering::Relaxed),
            batches_executed: batches,
            retries: counters.retries.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
            texts_embedded: texts,
            avg_batch_size: if batches > 0 {
                texts as f64 / batches as f64
            } else {
                0.0
            },
            queued_batches: self.shared.queue.lock().len(),
        }
    }
}

impl BatchShared {
    /// Dispatch queued batches up to the concurrent-batch bound
    fn drain(shared: &Arc<BatchShared>) {
        loop {
            let permit = match shared.slots.try_acquire() {
                Some(permit) => permit,
                None => break,
            };
            let batch = shared.queue.lock().pop_front();
            let batch = match batch {
                Some(batch) => batch,
                None => break, // permit drops, slot freed
            };

            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                let result = BatchShared::execute(&shared, &batch.texts, &batch.hashes).await;
                let _ = batch.tx.send(result);
                drop(permit);
            });
        }
    }

    /// Execute one batch with linear backoff, writing results to the cache
    async fn execute(
        shared: &Arc<BatchShared>,
        texts: &[String],
        hashes: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        let max_retries = shared.config.max_retries.max(1);
        let mut attempt = 1u32;
        loop {
            match shared.provider.embed_batch(texts).await {
                Ok(vectors) => {
                    if vectors.len() != texts.len() {
                        return Err(Error::Embedding(format!(
                            "provider returned {} vectors for {} texts",
                            vectors.len(),
                            texts.len()
                        )));
                    }
                    for (hash, vector) in hashes.iter().zip(vectors.iter()) {
                        shared.cache.insert(hash.clone(), vector.clone());
                    }
                    shared.counters.batches.fetch_add(1, Ordering::Relaxed);
                    shared
                        .counters
                        .texts_embedded
                        .fetch_add(texts.len() as u64, Ordering::Relaxed);
                    return Ok(vectors);
                }
                Err(e) if attempt < max_retries && e.is_retryable() => {
                    let delay = shared.config.retry_delay() * attempt;
                    tracing::warn!(
                        "Embedding batch of {} failed (attempt {}/{}): {}, retrying in {:?}",
                        texts.len(),
                        attempt,
                        max_retries,
                        e,
                        delay
                    );
                    shared.counters.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        "Embedding batch of {} failed permanently after {} attempt(s): {}",
                        texts.len(),
                        attempt,
                        e
                    );
                    shared.counters.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }
    }
}

/// Trim, pad to the minimum length, and truncate to the maximum length on a
/// char boundary
fn normalize(text: &str, min_len: usize, max_len: usize) -> String {
    let trimmed = text.trim();
    let mut normalized: String = if trimmed.chars().count() > max_len {
        trimmed.chars().take(max_len).collect()
    } else {
        trimmed.to_string()
    };
    let char_count = normalized.chars().count();
    if char_count < min_len {
        normalized.extend(std::iter::repeat(' ').take(min_len - char_count));
    }
    normalized
}

/// Batch collector metrics
#[derive(Debug, Clone, Serialize)]
pub struct BatchMetrics {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub deduplicated: u64,
    pub batches_executed: u64,
    pub retries: u64,
    pub failures: u64,
    pub texts_embedded: u64,
    pub avg_batch_size: f64,
    pub queued_batches: usize,
}
