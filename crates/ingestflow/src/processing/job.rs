//! Job types, processor contract, and execution context

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;

use super::slots::StagePools;

/// Job lifecycle states
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Processing,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    /// Whether this state ends the job's lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }
}

/// One recorded failure of a job attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    /// Attempt number that produced this error (1-based)
    pub attempt: u32,
    /// Error classification
    pub kind: String,
    /// Error message
    pub message: String,
    /// When the failure was recorded
    pub at: DateTime<Utc>,
}

/// Submission parameters for a job
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Job type label, used for logging and filtering
    pub job_type: String,
    /// Priority; higher values are more urgent
    pub priority: i32,
    /// Submitting owner (user or subsystem id)
    pub owner: String,
    /// Opaque payload handed to the processor
    pub payload: serde_json::Value,
    /// Override the scheduler's default attempt limit
    pub max_attempts: Option<u32>,
    /// Override the scheduler's default per-job timeout
    pub timeout: Option<Duration>,
}

impl JobSpec {
    /// Create a spec with default retry and timeout settings
    pub fn new(
        job_type: impl Into<String>,
        priority: i32,
        owner: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            job_type: job_type.into(),
            priority,
            owner: owner.into(),
            payload,
            max_attempts: None,
            timeout: None,
        }
    }
}

/// A scheduled job, owned exclusively by the scheduler until terminal
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub priority: i32,
    pub owner: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub timeout: Duration,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: u8,
    pub errors: Vec<JobError>,
    pub result: Option<serde_json::Value>,
}

impl Job {
    /// Point-in-time view served to status callers
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            job_type: self.job_type.clone(),
            priority: self.priority,
            owner: self.owner.clone(),
            state: self.state,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            progress: self.progress,
            errors: self.errors.clone(),
            result: self.result.clone(),
        }
    }
}

/// Serializable job status view
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub job_type: String,
    pub priority: i32,
    pub owner: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: u8,
    pub errors: Vec<JobError>,
    pub result: Option<serde_json::Value>,
}

/// Execution context handed to a running processor.
///
/// Cancellation is cooperative: processors must poll `is_cancelled` between
/// stages; in-flight network calls are not forcibly aborted, their results
/// are discarded once the job leaves the processing state.
#[derive(Clone)]
pub struct JobContext {
    /// Id of the running job
    pub job_id: Uuid,
    /// Payload from the submission
    pub payload: serde_json::Value,
    /// Attempt number for this execution (1-based)
    pub attempt: u32,
    /// Attempt limit for this job
    pub max_attempts: u32,
    /// Per-stage slot pools
    pub pools: Arc<StagePools>,
    cancelled: Arc<AtomicBool>,
    progress: Arc<AtomicU8>,
}

impl JobContext {
    pub(crate) fn new(
        job_id: Uuid,
        payload: serde_json::Value,
        attempt: u32,
        max_attempts: u32,
        pools: Arc<StagePools>,
        cancelled: Arc<AtomicBool>,
        progress: Arc<AtomicU8>,
    ) -> Self {
        Self {
            job_id,
            payload,
            attempt,
            max_attempts,
            pools,
            cancelled,
            progress,
        }
    }

    /// Whether the job has been cancelled; processors should return promptly
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Report job progress (0-100)
    pub fn report_progress(&self, percent: u8) {
        self.progress.store(percent.min(100), Ordering::SeqCst);
    }

    /// Whether this execution is the job's final allowed attempt
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Work definition executed by the scheduler
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Process one job attempt; the returned value is stored on the job
    async fn process(&self, ctx: JobContext) -> Result<serde_json::Value>;

    /// Processor name for logging
    fn name(&self) -> &str;
}

/// Coarse backpressure predicate consulted by the drain loop before new jobs
/// start, independent of the concurrency ceiling.
pub trait ResourceGate: Send + Sync {
    /// Whether a new job may start given the current running-payload estimate
    fn admit(&self, running_payload_bytes: usize) -> bool;
}

/// Default gate: bounds the summed estimated payload size of running jobs
pub struct PayloadMemoryGate {
    max_bytes: usize,
}

impl PayloadMemoryGate {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

impl ResourceGate for PayloadMemoryGate {
    fn admit(&self, running_payload_bytes: usize) -> bool {
        running_payload_bytes < self.max_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Retrying.is_terminal());
    }

    #[test]
    fn test_payload_gate() {
        let gate = PayloadMemoryGate::new(100);
        assert!(gate.admit(0));
        assert!(gate.admit(99));
        assert!(!gate.admit(100));
    }
}
