//! Job scheduling: priority lanes, slot pools, retries, and timeouts

mod job;
mod scheduler;
mod slots;

pub use job::{
    Job, JobContext, JobError, JobProcessor, JobSnapshot, JobSpec, JobState, PayloadMemoryGate,
    ResourceGate,
};
pub use scheduler::{JobScheduler, SchedulerStats};
pub use slots::{SlotPermit, SlotPool, StagePools};
