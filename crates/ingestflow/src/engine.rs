//! Engine facade wiring the orchestration components together
//!
//! All components are explicitly constructed and dependency-injected; there
//! is no global state. The engine owns the background tasks (batch window,
//! pool maintenance, health probe, auto-save) and fans shutdown out to them.

use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::batch::{BatchCollector, BatchMetrics};
use crate::cache::{CacheStats, ResourceCache};
use crate::config::IngestConfig;
use crate::error::Result;
use crate::pipeline::{IngestPayload, IngestProcessor};
use crate::pool::{ConnectionPool, PoolMetrics};
use crate::processing::{JobProcessor, JobScheduler, JobSnapshot, JobSpec, SchedulerStats, StagePools};
use crate::progress::{ProgressEvent, ProgressTracker, TrackerStatus};
use crate::providers::{EmbeddingProvider, TextExtractor, VectorStoreProvider};
use crate::storage::QueueStore;
use crate::upload::{QueueItem, QueueStatus, UploadFile, UploadQueueManager};

/// Ingestion engine: the caller-facing surface of the orchestration core
pub struct IngestEngine {
    config: IngestConfig,
    scheduler: Arc<JobScheduler>,
    cache: Arc<ResourceCache<Vec<f32>>>,
    batcher: Arc<BatchCollector>,
    pool: Arc<ConnectionPool>,
    uploads: Arc<UploadQueueManager>,
    progress: Arc<ProgressTracker>,
    processor: Arc<IngestProcessor>,
}

impl IngestEngine {
    /// Construct the engine and start its background tasks.
    ///
    /// Persisted upload queues are reloaded before any new work is accepted.
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: IngestConfig,
        extractor: Arc<dyn TextExtractor>,
        embedder: Arc<dyn EmbeddingProvider>,
        vector_store: Arc<dyn VectorStoreProvider>,
        store: Arc<dyn QueueStore>,
    ) -> Result<Self> {
        tracing::info!("Initializing ingestion engine...");

        let cache = Arc::new(ResourceCache::new(&config.cache));
        let pools = Arc::new(StagePools::new(&config.slots));
        let scheduler = Arc::new(JobScheduler::new(config.scheduler.clone(), Arc::clone(&pools)));

        let batcher = Arc::new(BatchCollector::new(
            config.batch.clone(),
            Arc::clone(&embedder),
            Arc::clone(&cache),
        ));
        batcher.start();

        let pool = Arc::new(ConnectionPool::new(config.pool.clone()));
        pool.start_maintenance();
        pool.start_health_probe({
            let vector_store = Arc::clone(&vector_store);
            move || {
                let vector_store = Arc::clone(&vector_store);
                async move { vector_store.health_check().await }
            }
        });

        let uploads = Arc::new(UploadQueueManager::new(config.upload.clone(), store));
        let restored = uploads.load_persisted()?;
        if restored > 0 {
            tracing::info!("Restored {} persisted upload queue(s)", restored);
        }
        uploads.start_autosave();

        let progress = Arc::new(ProgressTracker::new(&config.progress));

        let processor = Arc::new(IngestProcessor::new(
            config.chunking.clone(),
            extractor,
            Arc::clone(&batcher),
            Arc::clone(&pool),
            vector_store,
            Arc::clone(&uploads),
            Arc::clone(&progress),
        ));

        tracing::info!("Ingestion engine ready");
        Ok(Self {
            config,
            scheduler,
            cache,
            batcher,
            pool,
            uploads,
            progress,
            processor,
        })
    }

    // Job operations

    /// Submit a custom job
    pub fn submit_job(&self, spec: JobSpec, processor: Arc<dyn JobProcessor>) -> Result<Uuid> {
        self.scheduler.submit(spec, processor)
    }

    /// Status snapshot for a job
    pub fn job_status(&self, job_id: Uuid) -> Option<JobSnapshot> {
        self.scheduler.status(job_id)
    }

    /// Cancel a queued or processing job
    pub fn cancel_job(&self, job_id: Uuid) -> bool {
        self.scheduler.cancel(job_id)
    }

    /// Stop starting new jobs; running jobs finish normally
    pub fn pause_processing(&self) {
        self.scheduler.pause();
    }

    /// Resume starting jobs
    pub fn resume_processing(&self) {
        self.scheduler.resume();
    }

    // Upload queue operations

    pub fn create_queue(&self, user_id: &str, name: &str) -> Result<QueueStatus> {
        self.uploads.create_queue(user_id, name)
    }

    pub fn add_items(
        &self,
        user_id: &str,
        name: &str,
        files: Vec<UploadFile>,
    ) -> Result<Vec<QueueItem>> {
        self.uploads.add_items(user_id, name, files)
    }

    pub fn reorder(&self, user_id: &str, name: &str, item_id: Uuid, position: usize) -> Result<()> {
        self.uploads.reorder(user_id, name, item_id, position)
    }

    pub fn pause_queue(&self, user_id: &str, name: &str) -> Result<()> {
        self.uploads.pause(user_id, name)
    }

    pub fn resume_queue(&self, user_id: &str, name: &str) -> Result<()> {
        self.uploads.resume(user_id, name)
    }

    pub fn cleanup_queue(&self, user_id: &str, name: &str) -> Result<usize> {
        self.uploads.cleanup(user_id, name)
    }

    pub fn retry_failed_items(&self, user_id: &str, name: &str) -> Result<usize> {
        self.uploads.retry_failed(user_id, name)
    }

    pub fn queue_status(&self, user_id: &str, name: &str) -> Option<QueueStatus> {
        self.uploads.status(user_id, name)
    }

    /// Schedule every pending item of a queue as an ingestion job.
    ///
    /// Items are claimed in position order and skipped (with a warning) when
    /// their bytes are no longer held in memory, e.g. after a restart.
    pub fn enqueue_uploads(&self, user_id: &str, name: &str, priority: i32) -> Result<Vec<Uuid>> {
        let mut job_ids = Vec::new();
        while let Some(item) = self.uploads.next_pending(user_id, name)? {
            if self
                .uploads
                .item_data(user_id, name, item.id)
                .is_none()
            {
                tracing::warn!(
                    "Item '{}' has no stored bytes (restored queue?), marking failed",
                    item.filename
                );
                self.uploads.mark_failed(
                    user_id,
                    name,
                    item.id,
                    "file bytes were not retained across restart",
                )?;
                continue;
            }

            let payload = IngestPayload {
                user_id: user_id.to_string(),
                queue: name.to_string(),
                item_id: item.id,
                filename: item.filename.clone(),
            };
            let spec = JobSpec::new(
                "ingest-file",
                priority,
                user_id,
                serde_json::to_value(&payload)?,
            );
            let job_id = self
                .scheduler
                .submit(spec, Arc::clone(&self.processor) as Arc<dyn JobProcessor>)?;
            job_ids.push(job_id);
        }
        tracing::info!(
            "Enqueued {} upload(s) from queue '{}' for user {}",
            job_ids.len(),
            name,
            user_id
        );
        Ok(job_ids)
    }

    // Observability

    pub fn tracker_status(&self, tracker_id: Uuid) -> Option<TrackerStatus> {
        self.progress.status(tracker_id)
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    pub fn pool_metrics(&self) -> PoolMetrics {
        self.pool.metrics()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn batch_metrics(&self) -> BatchMetrics {
        self.batcher.metrics()
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// Engine configuration
    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Stop background tasks gracefully: pending batches are drained and
    /// dirty queues get a final save. Running jobs finish on their own.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down ingestion engine...");
        self.scheduler.pause();
        self.batcher.shutdown().await;
        self.pool.shutdown().await;
        self.uploads.shutdown().await;
        tracing::info!("Ingestion engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    use crate::config::{BatchConfig, PoolConfig, SchedulerConfig};
    use crate::error::Error;
    use crate::processing::JobState;
    use crate::providers::{ExtractedText, VectorMatch, VectorRecord};
    use crate::storage::SqliteQueueStore;
    use crate::upload::ItemStatus;

    struct StubExtractor;

    #[async_trait]
    impl TextExtractor for StubExtractor {
        async fn extract(&self, _filename: &str, data: &[u8]) -> Result<ExtractedText> {
            let content = String::from_utf8_lossy(data).to_string();
            Ok(ExtractedText {
                content_hash: crate::cache::content_hash(&content),
                content,
                total_pages: None,
            })
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }

        fn name(&self) -> &str {
            "stub-extractor"
        }
    }

    struct StubEmbedder;

    #[async_trait]
    impl EmbeddingProvider for StubEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            Ok(vec![text.len() as f32, 0.5])
        }

        fn dimensions(&self) -> usize {
            2
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }

        fn name(&self) -> &str {
            "stub-embedder"
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        upserted: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait]
    impl VectorStoreProvider for RecordingStore {
        async fn upsert(&self, records: &[VectorRecord], namespace: &str) -> Result<()> {
            self.upserted
                .lock()
                .push((namespace.to_string(), records.len()));
            Ok(())
        }

        async fn query(
            &self,
            _vector: &[f32],
            _namespace: &str,
            _top_k: usize,
            _filter: Option<&serde_json::Value>,
        ) -> Result<Vec<VectorMatch>> {
            Ok(Vec::new())
        }

        async fn len(&self, _namespace: &str) -> Result<usize> {
            Ok(self.upserted.lock().iter().map(|(_, n)| n).sum())
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }

        fn name(&self) -> &str {
            "recording-store"
        }
    }

    fn fast_config() -> IngestConfig {
        IngestConfig {
            scheduler: SchedulerConfig {
                max_concurrent_jobs: 2,
                retry_delay_ms: 10,
                ..SchedulerConfig::default()
            },
            batch: BatchConfig {
                batch_window_ms: 10,
                retry_delay_ms: 10,
                min_text_len: 1,
                ..BatchConfig::default()
            },
            pool: PoolConfig {
                health_interval_secs: 0,
                ..PoolConfig::default()
            },
            ..IngestConfig::default()
        }
    }

    fn engine_with(store: Arc<RecordingStore>) -> IngestEngine {
        IngestEngine::new(
            fast_config(),
            Arc::new(StubExtractor),
            Arc::new(StubEmbedder),
            store,
            Arc::new(SqliteQueueStore::in_memory().unwrap()),
        )
        .unwrap()
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_end_to_end_ingestion() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("ingestflow=debug")
            .try_init();
        let vector_store = Arc::new(RecordingStore::default());
        let engine = engine_with(Arc::clone(&vector_store));

        engine.create_queue("alice", "docs").unwrap();
        engine
            .add_items(
                "alice",
                "docs",
                vec![UploadFile {
                    filename: "notes.txt".to_string(),
                    data: b"the quick brown fox jumps over the lazy dog".to_vec(),
                }],
            )
            .unwrap();

        let job_ids = engine.enqueue_uploads("alice", "docs", 1).unwrap();
        assert_eq!(job_ids.len(), 1);

        wait_for(|| {
            engine
                .job_status(job_ids[0])
                .map(|s| s.state == JobState::Completed)
                .unwrap_or(false)
        })
        .await;

        // The vector store received one upsert in the user's namespace
        let upserts = vector_store.upserted.lock().clone();
        assert_eq!(upserts.len(), 1);
        assert_eq!(upserts[0].0, "alice");
        assert!(upserts[0].1 >= 1);

        // The queue item is completed
        let status = engine.queue_status("alice", "docs").unwrap();
        assert_eq!(status.completed, 1);

        // Progress reached a terminal state and is still pollable
        let tracker = engine.tracker_status(job_ids[0]).unwrap();
        assert!(tracker.completed);
        assert!((tracker.overall - 100.0).abs() < f64::EPSILON);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_item_reflected_in_queue() {
        struct FailingStore;

        #[async_trait]
        impl VectorStoreProvider for FailingStore {
            async fn upsert(&self, _records: &[VectorRecord], _namespace: &str) -> Result<()> {
                Err(Error::Store("permission denied for namespace".into()))
            }

            async fn query(
                &self,
                _vector: &[f32],
                _namespace: &str,
                _top_k: usize,
                _filter: Option<&serde_json::Value>,
            ) -> Result<Vec<VectorMatch>> {
                Ok(Vec::new())
            }

            async fn len(&self, _namespace: &str) -> Result<usize> {
                Ok(0)
            }

            async fn health_check(&self) -> Result<bool> {
                Ok(true)
            }

            fn name(&self) -> &str {
                "failing-store"
            }
        }

        let engine = IngestEngine::new(
            fast_config(),
            Arc::new(StubExtractor),
            Arc::new(StubEmbedder),
            Arc::new(FailingStore),
            Arc::new(SqliteQueueStore::in_memory().unwrap()),
        )
        .unwrap();

        engine.create_queue("bob", "docs").unwrap();
        engine
            .add_items(
                "bob",
                "docs",
                vec![UploadFile {
                    filename: "doomed.txt".to_string(),
                    data: b"some content that will not be stored".to_vec(),
                }],
            )
            .unwrap();

        let job_ids = engine.enqueue_uploads("bob", "docs", 0).unwrap();
        wait_for(|| {
            engine
                .job_status(job_ids[0])
                .map(|s| s.state == JobState::Failed)
                .unwrap_or(false)
        })
        .await;

        let status = engine.queue_status("bob", "docs").unwrap();
        assert_eq!(status.failed, 1);
        assert_eq!(status.items[0].status, ItemStatus::Failed);
        assert!(status.items[0].error.is_some());

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_metrics_surfaces() {
        let vector_store = Arc::new(RecordingStore::default());
        let engine = engine_with(vector_store);

        engine.create_queue("carol", "docs").unwrap();
        engine
            .add_items(
                "carol",
                "docs",
                vec![UploadFile {
                    filename: "a.txt".to_string(),
                    data: b"hello metrics".to_vec(),
                }],
            )
            .unwrap();
        let job_ids = engine.enqueue_uploads("carol", "docs", 0).unwrap();
        wait_for(|| {
            engine
                .job_status(job_ids[0])
                .map(|s| s.state.is_terminal())
                .unwrap_or(false)
        })
        .await;

        assert!(engine.scheduler_stats().completed >= 1);
        assert!(engine.batch_metrics().texts_embedded >= 1);
        assert!(engine.pool_metrics().successes >= 1);
        assert!(engine.cache_stats().entries >= 1);

        engine.shutdown().await;
    }
}
