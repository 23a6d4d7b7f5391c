//! ingestflow: orchestration core for a file-ingestion pipeline
//!
//! Files flow through extraction, chunking, embedding, and vector storage,
//! where every stage depends on rate-limited, fallible external services.
//! This crate provides the layer that keeps that pipeline safe under load:
//! a priority job scheduler with retries and timeouts, per-stage slot pools,
//! an adaptive connection pool with circuit breaking around the vector
//! store, a content-addressed cache, time-windowed embedding batches, and
//! durable, reorderable upload queues.
//!
//! The concrete extractors, embedding models, and vector databases live
//! behind the traits in [`providers`]; construct an [`IngestEngine`] with
//! your implementations to get the full caller surface.

pub mod batch;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod pool;
pub mod processing;
pub mod progress;
pub mod providers;
pub mod storage;
pub mod upload;

pub use config::IngestConfig;
pub use engine::IngestEngine;
pub use error::{Error, Result};
pub use processing::{JobProcessor, JobSnapshot, JobSpec, JobState};
pub use providers::{EmbeddingProvider, TextExtractor, VectorStoreProvider};
