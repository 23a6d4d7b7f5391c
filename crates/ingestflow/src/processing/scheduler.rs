//! Priority job scheduler
//!
//! Jobs wait in per-priority FIFO lanes and drain into a bounded number of
//! concurrent executions. The scheduler owns retry, timeout, and cancellation
//! handling; terminal jobs move to a bounded history for late status polls.

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::cache::EntryWeight;
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};

use super::job::{
    Job, JobContext, JobError, JobProcessor, JobSnapshot, JobSpec, JobState, PayloadMemoryGate,
    ResourceGate,
};
use super::slots::StagePools;

struct QueuedJob {
    job: Job,
    processor: Arc<dyn JobProcessor>,
}

struct RunningJob {
    job: Job,
    cancel: Arc<Notify>,
    cancelled: Arc<AtomicBool>,
    progress: Arc<AtomicU8>,
    payload_weight: usize,
}

#[derive(Default)]
struct Counters {
    submitted: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    retries: u64,
    timeouts: u64,
    total_duration_ms: u64,
}

struct Inner {
    /// Per-priority FIFO lanes; the highest key drains first
    lanes: BTreeMap<i32, VecDeque<QueuedJob>>,
    queued: usize,
    running: HashMap<Uuid, RunningJob>,
    /// Jobs waiting out a retry backoff
    retrying: HashMap<Uuid, QueuedJob>,
    /// Terminal jobs, oldest evicted
    history: VecDeque<Job>,
    paused: bool,
    counters: Counters,
}

struct Shared {
    config: SchedulerConfig,
    pools: Arc<StagePools>,
    gate: Box<dyn ResourceGate>,
    inner: Mutex<Inner>,
}

/// Priority job scheduler with bounded concurrency, retries, and timeouts
pub struct JobScheduler {
    shared: Arc<Shared>,
}

impl JobScheduler {
    /// Create a scheduler with the default payload-memory backpressure gate
    pub fn new(config: SchedulerConfig, pools: Arc<StagePools>) -> Self {
        let gate = Box::new(PayloadMemoryGate::new(config.max_running_payload_bytes));
        Self::with_gate(config, pools, gate)
    }

    /// Create a scheduler with a custom backpressure gate
    pub fn with_gate(
        config: SchedulerConfig,
        pools: Arc<StagePools>,
        gate: Box<dyn ResourceGate>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                pools,
                gate,
                inner: Mutex::new(Inner {
                    lanes: BTreeMap::new(),
                    queued: 0,
                    running: HashMap::new(),
                    retrying: HashMap::new(),
                    history: VecDeque::new(),
                    paused: false,
                    counters: Counters::default(),
                }),
            }),
        }
    }

    /// Submit a job for execution.
    ///
    /// The job is inserted behind all queued jobs of equal or higher priority
    /// and ahead of strictly lower priorities. Must be called from within a
    /// tokio runtime; execution starts as soon as capacity allows.
    pub fn submit(&self, spec: JobSpec, processor: Arc<dyn JobProcessor>) -> Result<Uuid> {
        if spec.owner.trim().is_empty() {
            return Err(Error::Validation("job owner must not be empty".into()));
        }
        if spec.payload.is_null() {
            return Err(Error::Validation("job payload must not be null".into()));
        }
        let max_attempts = spec.max_attempts.unwrap_or(self.shared.config.max_attempts);
        if max_attempts == 0 {
            return Err(Error::Validation("max_attempts must be at least 1".into()));
        }

        let job = Job {
            id: Uuid::new_v4(),
            job_type: spec.job_type,
            priority: spec.priority,
            owner: spec.owner,
            payload: spec.payload,
            state: JobState::Queued,
            attempts: 0,
            max_attempts,
            timeout: spec.timeout.unwrap_or_else(|| self.shared.config.job_timeout()),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: 0,
            errors: Vec::new(),
            result: None,
        };
        let job_id = job.id;

        {
            let inner = &mut *self.shared.inner.lock();
            if inner.queued >= self.shared.config.max_queue_size {
                return Err(Error::ResourceExhausted(format!(
                    "job queue is at capacity ({})",
                    self.shared.config.max_queue_size
                )));
            }
            inner
                .lanes
                .entry(job.priority)
                .or_default()
                .push_back(QueuedJob { job, processor });
            inner.queued += 1;
            inner.counters.submitted += 1;
        }

        tracing::debug!("Job {} queued", job_id);
        Shared::drain(&self.shared);
        Ok(job_id)
    }

    /// Cancel a queued or processing job.
    ///
    /// Queued jobs are removed immediately; processing jobs are signalled and
    /// transition once the running task observes the signal. Jobs waiting out
    /// a retry backoff or already terminal cannot be cancelled.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        let inner = &mut *self.shared.inner.lock();

        let queued_prio = inner
            .lanes
            .iter()
            .find(|(_, lane)| lane.iter().any(|q| q.job.id == job_id))
            .map(|(&prio, _)| prio);
        if let Some(prio) = queued_prio {
            let lane = match inner.lanes.get_mut(&prio) {
                Some(lane) => lane,
                None => return false,
            };
            let pos = match lane.iter().position(|q| q.job.id == job_id) {
                Some(pos) => pos,
                None => return false,
            };
            let mut queued = match lane.remove(pos) {
                Some(queued) => queued,
                None => return false,
            };
            if lane.is_empty() {
                inner.lanes.remove(&prio);
            }
            inner.queued -= 1;
            queued.job.state = JobState::Cancelled;
            queued.job.completed_at = Some(Utc::now());
            inner.counters.cancelled += 1;
            Self::push_history(inner, &self.shared.config, queued.job);
            tracing::info!("Job {} cancelled while queued", job_id);
            return true;
        }

        if let Some(running) = inner.running.get(&job_id) {
            running.cancelled.store(true, Ordering::SeqCst);
            running.cancel.notify_one();
            tracing::info!("Job {} cancellation requested", job_id);
            return true;
        }

        false
    }

    /// Status snapshot for a queued, running, retrying, or recent job
    pub fn status(&self, job_id: Uuid) -> Option<JobSnapshot> {
        let inner = self.shared.inner.lock();

        if let Some(running) = inner.running.get(&job_id) {
            let mut snapshot = running.job.snapshot();
            snapshot.progress = running.progress.load(Ordering::SeqCst);
            return Some(snapshot);
        }
        if let Some(retrying) = inner.retrying.get(&job_id) {
            return Some(retrying.job.snapshot());
        }
        for lane in inner.lanes.values() {
            if let Some(queued) = lane.iter().find(|q| q.job.id == job_id) {
                return Some(queued.job.snapshot());
            }
        }
        inner
            .history
            .iter()
            .find(|job| job.id == job_id)
            .map(Job::snapshot)
    }

    /// Stop starting new jobs; running jobs finish normally
    pub fn pause(&self) {
        self.shared.inner.lock().paused = true;
        tracing::info!("Job scheduler paused");
    }

    /// Resume starting jobs and drain immediately
    pub fn resume(&self) {
        self.shared.inner.lock().paused = false;
        tracing::info!("Job scheduler resumed");
        Shared::drain(&self.shared);
    }

    /// Rolling scheduler statistics
    pub fn stats(&self) -> SchedulerStats {
        let inner = self.shared.inner.lock();
        let counters = &inner.counters;
        SchedulerStats {
            submitted: counters.submitted,
            completed: counters.completed,
            failed: counters.failed,
            cancelled: counters.cancelled,
            retries: counters.retries,
            timeouts: counters.timeouts,
            queued: inner.queued,
            running: inner.running.len(),
            avg_duration_ms: if counters.completed > 0 {
                counters.total_duration_ms / counters.completed
            } else {
                0
            },
        }
    }

    /// Stage pools shared with running jobs
    pub fn pools(&self) -> Arc<StagePools> {
        Arc::clone(&self.shared.pools)
    }

    fn push_history(inner: &mut Inner, config: &SchedulerConfig, job: Job) {
        inner.history.push_back(job);
        while inner.history.len() > config.history_size {
            inner.history.pop_front();
        }
    }
}

impl Shared {
    /// Start queued jobs while concurrency, pause state, and the resource
    /// gate allow. Re-invoked after every submit, completion, and retry.
    fn drain(shared: &Arc<Shared>) {
        loop {
            let spawned = {
                let inner = &mut *shared.inner.lock();
                if inner.paused || inner.running.len() >= shared.config.max_concurrent_jobs {
                    return;
                }

                let running_payload: usize =
                    inner.running.values().map(|r| r.payload_weight).sum();
                if !shared.gate.admit(running_payload) {
                    tracing::debug!(
                        "Backpressure: {} bytes of running payload, deferring drain",
                        running_payload
                    );
                    return;
                }

                let prio = match inner.lanes.keys().next_back() {
                    Some(&prio) => prio,
                    None => return,
                };
                let mut queued = {
                    let lane = match inner.lanes.get_mut(&prio) {
                        Some(lane) => lane,
                        None => return,
                    };
                    let queued = match lane.pop_front() {
                        Some(queued) => queued,
                        None => return,
                    };
                    if lane.is_empty() {
                        inner.lanes.remove(&prio);
                    }
                    queued
                };
                inner.queued -= 1;

                queued.job.state = JobState::Processing;
                queued.job.started_at = Some(Utc::now());
                queued.job.attempts += 1;

                let cancel = Arc::new(Notify::new());
                let cancelled = Arc::new(AtomicBool::new(false));
                let progress = Arc::new(AtomicU8::new(queued.job.progress));
                let payload_weight = queued.job.payload.weight();
                inner.running.insert(
                    queued.job.id,
                    RunningJob {
                        job: queued.job.clone(),
                        cancel: Arc::clone(&cancel),
                        cancelled: Arc::clone(&cancelled),
                        progress: Arc::clone(&progress),
                        payload_weight,
                    },
                );
                (queued, cancel, cancelled, progress)
            };

            let (queued, cancel, cancelled, progress) = spawned;
            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                Shared::run_job(shared, queued, cancel, cancelled, progress).await;
            });
        }
    }

    async fn run_job(
        shared: Arc<Shared>,
        queued: QueuedJob,
        cancel: Arc<Notify>,
        cancelled: Arc<AtomicBool>,
        progress: Arc<AtomicU8>,
    ) {
        let job = queued.job;
        let processor = queued.processor;
        let job_id = job.id;

        tracing::info!(
            "Job {} started (type: {}, priority: {}, attempt {}/{})",
            job_id,
            job.job_type,
            job.priority,
            job.attempts,
            job.max_attempts
        );

        let ctx = JobContext::new(
            job_id,
            job.payload.clone(),
            job.attempts,
            job.max_attempts,
            Arc::clone(&shared.pools),
            Arc::clone(&cancelled),
            Arc::clone(&progress),
        );

        // Whichever finishes first wins: the processor, the per-job timeout,
        // or an explicit cancellation signal.
        let outcome = tokio::select! {
            res = tokio::time::timeout(job.timeout, processor.process(ctx)) => match res {
                Ok(result) => Some(result),
                Err(_) => Some(Err(Error::Timeout(format!(
                    "job exceeded its {}s budget",
                    job.timeout.as_secs()
                )))),
            },
            _ = cancel.notified() => None,
        };

        Shared::settle(&shared, job_id, processor, outcome, &cancelled);
        Shared::drain(&shared);
    }

    /// Apply a finished attempt's outcome: completion, cancellation, retry
    /// scheduling, or permanent failure.
    fn settle(
        shared: &Arc<Shared>,
        job_id: Uuid,
        processor: Arc<dyn JobProcessor>,
        outcome: Option<Result<serde_json::Value>>,
        cancelled: &AtomicBool,
    ) {
        let inner = &mut *shared.inner.lock();
        let mut job = match inner.running.remove(&job_id) {
            Some(running) => {
                let mut job = running.job;
                job.progress = running.progress.load(Ordering::SeqCst);
                job
            }
            None => return,
        };
        let now = Utc::now();

        // A result arriving after cancellation is discarded
        if cancelled.load(Ordering::SeqCst) || outcome.is_none() {
            job.state = JobState::Cancelled;
            job.completed_at = Some(now);
            inner.counters.cancelled += 1;
            tracing::info!("Job {} cancelled", job_id);
            JobScheduler::push_history(inner, &shared.config, job);
            return;
        }

        match outcome.unwrap_or_else(|| Err(Error::Internal("missing job outcome".into()))) {
            Ok(result) => {
                job.state = JobState::Completed;
                job.completed_at = Some(now);
                job.progress = 100;
                job.result = Some(result);
                inner.counters.completed += 1;
                if let Some(started) = job.started_at {
                    inner.counters.total_duration_ms +=
                        (now - started).num_milliseconds().max(0) as u64;
                }
                tracing::info!("Job {} completed (attempt {})", job_id, job.attempts);
                JobScheduler::push_history(inner, &shared.config, job);
            }
            Err(error) => {
                if matches!(error, Error::Timeout(_)) {
                    inner.counters.timeouts += 1;
                }
                job.errors.push(JobError {
                    attempt: job.attempts,
                    kind: error.kind().to_string(),
                    message: error.to_string(),
                    at: now,
                });

                if job.attempts < job.max_attempts && error.is_retryable() {
                    let delay = shared.config.retry_delay() * job.attempts;
                    tracing::warn!(
                        "Job {} attempt {}/{} failed ({}), retrying in {:?}",
                        job_id,
                        job.attempts,
                        job.max_attempts,
                        error,
                        delay
                    );
                    job.state = JobState::Retrying;
                    inner.counters.retries += 1;
                    inner.retrying.insert(job_id, QueuedJob { job, processor });

                    let shared = Arc::clone(shared);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        Shared::requeue(&shared, job_id);
                    });
                } else {
                    tracing::error!(
                        "Job {} failed permanently after {} attempt(s): {}",
                        job_id,
                        job.attempts,
                        error
                    );
                    job.state = JobState::Failed;
                    job.completed_at = Some(now);
                    inner.counters.failed += 1;
                    JobScheduler::push_history(inner, &shared.config, job);
                }
            }
        }
    }

    /// Move a job whose backoff has elapsed back into its priority lane
    fn requeue(shared: &Arc<Shared>, job_id: Uuid) {
        {
            let inner = &mut *shared.inner.lock();
            let mut queued = match inner.retrying.remove(&job_id) {
                Some(queued) => queued,
                None => return,
            };
            queued.job.state = JobState::Queued;
            queued.job.progress = 0;
            inner
                .lanes
                .entry(queued.job.priority)
                .or_default()
                .push_back(queued);
            inner.queued += 1;
        }
        Shared::drain(shared);
    }
}

/// Rolling scheduler statistics
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub queued: usize,
    pub running: usize,
    pub avg_duration_ms: u64,
}
