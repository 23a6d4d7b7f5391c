//! Configuration for the ingestion orchestration core

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Job scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Per-stage slot pool sizes
    #[serde(default)]
    pub slots: SlotConfig,
    /// Embedding result cache configuration
    #[serde(default)]
    pub cache: CacheConfig,
    /// Vector store connection pool configuration
    #[serde(default)]
    pub pool: PoolConfig,
    /// Embedding batch collector configuration
    #[serde(default)]
    pub batch: BatchConfig,
    /// Upload queue configuration
    #[serde(default)]
    pub upload: UploadConfig,
    /// Progress tracker configuration
    #[serde(default)]
    pub progress: ProgressConfig,
    /// Text chunking configuration
    #[serde(default)]
    pub chunking: ChunkingConfig,
}

impl IngestConfig {
    /// Parse a configuration from a TOML string
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Config(format!("invalid config: {}", e)))
    }

    /// Load a configuration from a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;
        Self::from_toml_str(&raw)
    }
}

/// Job scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum jobs executing concurrently
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// Maximum jobs waiting in the priority queue
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Default attempts per job (submit may override)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Per-job hard timeout in seconds
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,
    /// Base retry delay in milliseconds; actual delay is `retry_delay * attempts`
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    /// Completed/failed jobs retained for status polling
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    /// Backpressure cap on the summed payload size of running jobs (bytes)
    #[serde(default = "default_max_running_payload")]
    pub max_running_payload_bytes: usize,
}

fn default_max_concurrent_jobs() -> usize {
    num_cpus::get().min(8)
}
fn default_max_queue_size() -> usize {
    1000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_job_timeout() -> u64 {
    300
}
fn default_retry_delay() -> u64 {
    1000
}
fn default_history_size() -> usize {
    500
}
fn default_max_running_payload() -> usize {
    256 * 1024 * 1024 // 256MB
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            max_queue_size: default_max_queue_size(),
            max_attempts: default_max_attempts(),
            job_timeout_secs: default_job_timeout(),
            retry_delay_ms: default_retry_delay(),
            history_size: default_history_size(),
            max_running_payload_bytes: default_max_running_payload(),
        }
    }
}

impl SchedulerConfig {
    /// Per-job timeout as a duration
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    /// Base retry delay as a duration
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Per-stage slot pool sizes
///
/// One pool per downstream dependency class so that scheduler-level job
/// parallelism cannot overload any single dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotConfig {
    /// Concurrent document extractions
    #[serde(default = "default_document_slots")]
    pub document_slots: usize,
    /// Concurrent chunking operations
    #[serde(default = "default_chunk_slots")]
    pub chunk_slots: usize,
    /// Concurrent embedding requests
    #[serde(default = "default_embedding_slots")]
    pub embedding_slots: usize,
}

fn default_document_slots() -> usize {
    num_cpus::get().min(8)
}
fn default_chunk_slots() -> usize {
    num_cpus::get().min(8)
}
fn default_embedding_slots() -> usize {
    num_cpus::get().min(4)
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            document_slots: default_document_slots(),
            chunk_slots: default_chunk_slots(),
            embedding_slots: default_embedding_slots(),
        }
    }
}

/// Embedding result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
    /// Estimated memory budget in bytes
    #[serde(default = "default_cache_memory")]
    pub max_memory_bytes: usize,
    /// Default entry TTL in seconds
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

fn default_cache_entries() -> usize {
    10_000
}
fn default_cache_memory() -> usize {
    128 * 1024 * 1024 // 128MB
}
fn default_cache_ttl() -> u64 {
    3600
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_entries(),
            max_memory_bytes: default_cache_memory(),
            ttl_secs: default_cache_ttl(),
        }
    }
}

impl CacheConfig {
    /// Default TTL as a duration
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Vector store connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Initial connection limit
    #[serde(default = "default_initial_connections")]
    pub initial_connections: usize,
    /// Adaptive sizing never shrinks below this floor
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,
    /// Adaptive sizing never grows above this ceiling
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Timeout waiting for a free connection slot, in milliseconds
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,
    /// Hard timeout for a single pooled call, in milliseconds
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,
    /// Consecutive/aggregate failures before the breaker opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Successes in half-open before the breaker closes
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Open -> half-open cooldown in seconds
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: u64,
    /// Adaptive resize check interval in seconds
    #[serde(default = "default_resize_interval")]
    pub resize_interval_secs: u64,
    /// Utilization above which the pool grows
    #[serde(default = "default_scale_up_threshold")]
    pub scale_up_threshold: f64,
    /// Utilization below which the pool shrinks
    #[serde(default = "default_scale_down_threshold")]
    pub scale_down_threshold: f64,
    /// Health probe interval in seconds (0 disables the probe)
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
}

fn default_initial_connections() -> usize {
    4
}
fn default_min_connections() -> usize {
    2
}
fn default_max_connections() -> usize {
    16
}
fn default_acquire_timeout() -> u64 {
    5_000
}
fn default_call_timeout() -> u64 {
    30_000
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    2
}
fn default_recovery_timeout() -> u64 {
    30
}
fn default_resize_interval() -> u64 {
    10
}
fn default_scale_up_threshold() -> f64 {
    0.8
}
fn default_scale_down_threshold() -> f64 {
    0.3
}
fn default_health_interval() -> u64 {
    30
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_connections: default_initial_connections(),
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout(),
            call_timeout_ms: default_call_timeout(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            recovery_timeout_secs: default_recovery_timeout(),
            resize_interval_secs: default_resize_interval(),
            scale_up_threshold: default_scale_up_threshold(),
            scale_down_threshold: default_scale_down_threshold(),
            health_interval_secs: default_health_interval(),
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

/// Embedding batch collector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Texts per embedding batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Batch window: how often queued batches are dispatched, in milliseconds
    #[serde(default = "default_batch_window")]
    pub batch_window_ms: u64,
    /// Batches executing concurrently
    #[serde(default = "default_concurrent_batches")]
    pub max_concurrent_batches: usize,
    /// Retries per batch before its callers are rejected
    #[serde(default = "default_batch_retries")]
    pub max_retries: u32,
    /// Base retry delay in milliseconds; actual delay is `retry_delay * attempt`
    #[serde(default = "default_batch_retry_delay")]
    pub retry_delay_ms: u64,
    /// Inputs shorter than this are padded (characters)
    #[serde(default = "default_min_text_len")]
    pub min_text_len: usize,
    /// Inputs longer than this are truncated (characters)
    #[serde(default = "default_max_text_len")]
    pub max_text_len: usize,
}

fn default_batch_size() -> usize {
    32
}
fn default_batch_window() -> u64 {
    50
}
fn default_concurrent_batches() -> usize {
    4
}
fn default_batch_retries() -> u32 {
    3
}
fn default_batch_retry_delay() -> u64 {
    500
}
fn default_min_text_len() -> usize {
    3
}
fn default_max_text_len() -> usize {
    8192
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_window_ms: default_batch_window(),
            max_concurrent_batches: default_concurrent_batches(),
            max_retries: default_batch_retries(),
            retry_delay_ms: default_batch_retry_delay(),
            min_text_len: default_min_text_len(),
            max_text_len: default_max_text_len(),
        }
    }
}

impl BatchConfig {
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Upload queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Maximum size of a single file in bytes
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    /// Maximum aggregate pending size per queue in bytes
    #[serde(default = "default_max_total_bytes")]
    pub max_total_bytes: u64,
    /// Auto-save interval in seconds
    #[serde(default = "default_autosave_interval")]
    pub autosave_interval_secs: u64,
}

fn default_max_file_bytes() -> u64 {
    100 * 1024 * 1024 // 100MB
}
fn default_max_total_bytes() -> u64 {
    1024 * 1024 * 1024 // 1GB
}
fn default_autosave_interval() -> u64 {
    30
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: default_max_file_bytes(),
            max_total_bytes: default_max_total_bytes(),
            autosave_interval_secs: default_autosave_interval(),
        }
    }
}

/// Text chunking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Target chunk size in characters
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Overlap between chunks in characters
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    /// Minimum chunk size (smaller trailing chunks are skipped)
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,
    /// Timeout for a single extraction call, in seconds
    #[serde(default = "default_extract_timeout")]
    pub extract_timeout_secs: u64,
}

fn default_chunk_size() -> usize {
    1024
}
fn default_chunk_overlap() -> usize {
    200
}
fn default_min_chunk_size() -> usize {
    100
}
fn default_extract_timeout() -> u64 {
    120
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            min_chunk_size: default_min_chunk_size(),
            extract_timeout_secs: default_extract_timeout(),
        }
    }
}

impl ChunkingConfig {
    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_secs)
    }
}

/// Progress tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// How long terminal trackers remain pollable, in seconds
    #[serde(default = "default_retention")]
    pub terminal_retention_secs: u64,
}

fn default_retention() -> u64 {
    60
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            terminal_retention_secs: default_retention(),
        }
    }
}

impl ProgressConfig {
    pub fn terminal_retention(&self) -> Duration {
        Duration::from_secs(self.terminal_retention_secs)
    }
}
