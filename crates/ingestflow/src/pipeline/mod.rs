//! The canonical file-ingestion job
//!
//! Drives one upload-queue item through the pipeline: extraction, chunking,
//! batched embedding, and a pooled vector-store upsert, with per-stage slot
//! permits, progress updates, and cooperative cancellation between stages.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::batch::BatchCollector;
use crate::config::ChunkingConfig;
use crate::error::{Error, Result};
use crate::pool::ConnectionPool;
use crate::processing::{JobContext, JobProcessor};
use crate::progress::{ProgressTracker, Stage};
use crate::providers::{TextExtractor, VectorRecord, VectorStoreProvider};
use crate::upload::UploadQueueManager;

/// Job payload identifying one queued upload item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestPayload {
    pub user_id: String,
    pub queue: String,
    pub item_id: Uuid,
    pub filename: String,
}

/// Processor executing the extract -> chunk -> embed -> store pipeline
pub struct IngestProcessor {
    config: ChunkingConfig,
    extractor: Arc<dyn TextExtractor>,
    batcher: Arc<BatchCollector>,
    pool: Arc<ConnectionPool>,
    vector_store: Arc<dyn VectorStoreProvider>,
    uploads: Arc<UploadQueueManager>,
    progress: Arc<ProgressTracker>,
}

impl IngestProcessor {
    pub fn new(
        config: ChunkingConfig,
        extractor: Arc<dyn TextExtractor>,
        batcher: Arc<BatchCollector>,
        pool: Arc<ConnectionPool>,
        vector_store: Arc<dyn VectorStoreProvider>,
        uploads: Arc<UploadQueueManager>,
        progress: Arc<ProgressTracker>,
    ) -> Self {
        Self {
            config,
            extractor,
            batcher,
            pool,
            vector_store,
            uploads,
            progress,
        }
    }

    async fn run(&self, ctx: &JobContext, payload: &IngestPayload) -> Result<serde_json::Value> {
        let tracker_id = ctx.job_id;
        let data = self
            .uploads
            .item_data(&payload.user_id, &payload.queue, payload.item_id)
            .ok_or_else(|| {
                Error::Validation(format!(
                    "no stored bytes for item {} in queue '{}'",
                    payload.item_id, payload.queue
                ))
            })?;

        // Extraction
        if ctx.is_cancelled() {
            return Err(Error::Cancelled("job cancelled before extraction".into()));
        }
        let extracted = {
            let _slot = ctx.pools.documents.acquire().await?;
            tracing::info!("[{}] Extracting text ({} bytes)", payload.filename, data.len());
            let result = tokio::time::timeout(
                self.config.extract_timeout(),
                self.extractor.extract(&payload.filename, &data),
            )
            .await;
            match result {
                Ok(extracted) => extracted?,
                Err(_) => {
                    return Err(Error::Timeout(format!(
                        "extraction of '{}' exceeded {}s",
                        payload.filename,
                        self.config.extract_timeout_secs
                    )))
                }
            }
        };
        let _ = self.progress.update_stage(tracker_id, Stage::Extraction, 100);
        ctx.report_progress(25);

        // Chunking
        if ctx.is_cancelled() {
            return Err(Error::Cancelled("job cancelled before chunking".into()));
        }
        let chunks = {
            let _slot = ctx.pools.chunks.acquire().await?;
            chunk_text(
                &extracted.content,
                self.config.chunk_size,
                self.config.chunk_overlap,
                self.config.min_chunk_size,
            )
        };
        let _ = self.progress.update_stage(tracker_id, Stage::Chunking, 100);
        ctx.report_progress(40);
        tracing::info!("[{}] Created {} chunk(s)", payload.filename, chunks.len());

        if chunks.is_empty() {
            let _ = self.progress.update_stage(tracker_id, Stage::Embedding, 100);
            let _ = self.progress.update_stage(tracker_id, Stage::Storing, 100);
            return Ok(serde_json::json!({
                "filename": payload.filename,
                "chunks": 0,
                "content_hash": extracted.content_hash,
            }));
        }

        // Embedding (batched, deduplicated, cached)
        if ctx.is_cancelled() {
            return Err(Error::Cancelled("job cancelled before embedding".into()));
        }
        let vectors = {
            let _slot = ctx.pools.embeddings.acquire().await?;
            self.batcher.process(&chunks).await?
        };
        let _ = self.progress.update_stage(tracker_id, Stage::Embedding, 100);
        ctx.report_progress(85);

        // Storing, gated by the connection pool and circuit breaker
        if ctx.is_cancelled() {
            return Err(Error::Cancelled("job cancelled before storing".into()));
        }
        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(vectors)
            .enumerate()
            .map(|(index, (chunk, vector))| VectorRecord {
                id: Uuid::new_v4(),
                vector,
                metadata: serde_json::json!({
                    "filename": payload.filename,
                    "item_id": payload.item_id,
                    "chunk_index": index,
                    "content": chunk,
                    "content_hash": extracted.content_hash,
                }),
            })
            .collect();
        let namespace = payload.user_id.as_str();
        self.pool
            .execute(|| self.vector_store.upsert(&records, namespace))
            .await?;
        let _ = self.progress.update_stage(tracker_id, Stage::Storing, 100);
        ctx.report_progress(100);

        tracing::info!(
            "[{}] Stored {} chunk(s) for user {}",
            payload.filename,
            records.len(),
            payload.user_id
        );
        Ok(serde_json::json!({
            "filename": payload.filename,
            "chunks": records.len(),
            "content_hash": extracted.content_hash,
        }))
    }
}

#[async_trait]
impl JobProcessor for IngestProcessor {
    async fn process(&self, ctx: JobContext) -> Result<serde_json::Value> {
        let payload: IngestPayload = serde_json::from_value(ctx.payload.clone())
            .map_err(|e| Error::Validation(format!("malformed ingest payload: {}", e)))?;

        if ctx.attempt == 1 {
            self.progress.create(ctx.job_id);
        }

        match self.run(&ctx, &payload).await {
            Ok(result) => {
                self.progress.complete(ctx.job_id);
                if let Err(e) =
                    self.uploads
                        .mark_completed(&payload.user_id, &payload.queue, payload.item_id)
                {
                    tracing::warn!("Failed to mark item {} completed: {}", payload.item_id, e);
                }
                Ok(result)
            }
            Err(error) => {
                // The scheduler may still retry; only a final outcome is
                // reflected into the upload queue.
                if ctx.is_final_attempt() || !error.is_retryable() {
                    self.progress.fail(ctx.job_id, error.to_string());
                    if let Err(e) = self.uploads.mark_failed(
                        &payload.user_id,
                        &payload.queue,
                        payload.item_id,
                        error.to_string(),
                    ) {
                        tracing::warn!("Failed to mark item {} failed: {}", payload.item_id, e);
                    }
                }
                Err(error)
            }
        }
    }

    fn name(&self) -> &str {
        "ingest-file"
    }
}

/// Split text into overlapping character-bounded chunks.
///
/// Trailing chunks shorter than `min_chunk_size` are skipped unless they are
/// the only content.
pub fn chunk_text(
    text: &str,
    chunk_size: usize,
    chunk_overlap: usize,
    min_chunk_size: usize,
) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    let chunk_size = chunk_size.max(1);
    let overlap = chunk_overlap.min(chunk_size.saturating_sub(1));
    let step = chunk_size - overlap;

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + chunk_size).min(chars.len());
        let chunk: String = chars[start..end].iter().collect();
        let trimmed = chunk.trim();
        if !trimmed.is_empty() && (trimmed.chars().count() >= min_chunk_size || chunks.is_empty()) {
            chunks.push(trimmed.to_string());
        }
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}
