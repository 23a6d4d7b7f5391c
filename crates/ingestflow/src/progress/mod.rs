//! Weighted multi-stage progress tracking
//!
//! Each tracker aggregates fixed-weight stage percentages into an overall
//! figure with a linearly extrapolated ETA. Terminal trackers stay pollable
//! for a short grace period so late status requests still succeed.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::ProgressConfig;
use crate::error::{Error, Result};

/// Pipeline stages, in execution order
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extraction,
    Chunking,
    Embedding,
    Storing,
}

impl Stage {
    /// All stages with their default weights (summing to 100)
    pub fn default_weights() -> Vec<(Stage, u8)> {
        vec![
            (Stage::Extraction, 25),
            (Stage::Chunking, 10),
            (Stage::Embedding, 45),
            (Stage::Storing, 20),
        ]
    }
}

/// Progress event broadcast to subscribers
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum ProgressEvent {
    Created { tracker_id: Uuid },
    Updated { tracker_id: Uuid, stage: Stage, stage_percent: u8, overall: f64 },
    Completed { tracker_id: Uuid },
    Failed { tracker_id: Uuid, error: String },
}

struct TrackerState {
    stages: Vec<(Stage, u8, u8)>, // (stage, weight, percent)
    started: Instant,
    created_at: DateTime<Utc>,
    completed: bool,
    error: Option<String>,
}

impl TrackerState {
    fn overall(&self) -> f64 {
        let total_weight: u32 = self.stages.iter().map(|(_, w, _)| *w as u32).sum();
        if total_weight == 0 {
            return 0.0;
        }
        let weighted: u32 = self
            .stages
            .iter()
            .map(|(_, w, p)| *w as u32 * *p as u32)
            .sum();
        weighted as f64 / total_weight as f64
    }

    fn eta_secs(&self) -> Option<u64> {
        let overall = self.overall();
        if overall <= 0.0 || overall >= 100.0 {
            return None;
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        Some((elapsed * (100.0 - overall) / overall) as u64)
    }
}

/// Serializable tracker status
#[derive(Debug, Clone, Serialize)]
pub struct TrackerStatus {
    pub tracker_id: Uuid,
    pub stages: Vec<StageStatus>,
    pub overall: f64,
    pub eta_secs: Option<u64>,
    pub completed: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-stage progress view
#[derive(Debug, Clone, Serialize)]
pub struct StageStatus {
    pub stage: Stage,
    pub weight: u8,
    pub percent: u8,
}

/// Tracks weighted multi-stage progress for running work
pub struct ProgressTracker {
    trackers: Arc<DashMap<Uuid, TrackerState>>,
    weights: Vec<(Stage, u8)>,
    retention: std::time::Duration,
    events: broadcast::Sender<ProgressEvent>,
}

impl ProgressTracker {
    /// Create a tracker registry with the default stage weights
    pub fn new(config: &ProgressConfig) -> Self {
        Self::with_weights(config, Stage::default_weights())
    }

    /// Create a tracker registry with custom stage weights (must sum to 100)
    pub fn with_weights(config: &ProgressConfig, weights: Vec<(Stage, u8)>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            trackers: Arc::new(DashMap::new()),
            weights,
            retention: config.terminal_retention(),
            events,
        }
    }

    /// Start tracking; the id doubles as the job id in the engine
    pub fn create(&self, tracker_id: Uuid) {
        let state = TrackerState {
            stages: self.weights.iter().map(|&(s, w)| (s, w, 0)).collect(),
            started: Instant::now(),
            created_at: Utc::now(),
            completed: false,
            error: None,
        };
        self.trackers.insert(tracker_id, state);
        let _ = self.events.send(ProgressEvent::Created { tracker_id });
    }

    /// Set a stage's progress (clamped to 0-100) and recompute the overall
    pub fn update_stage(&self, tracker_id: Uuid, stage: Stage, percent: u8) -> Result<()> {
        let mut entry = self
            .trackers
            .get_mut(&tracker_id)
            .ok_or_else(|| Error::Validation(format!("unknown tracker {}", tracker_id)))?;

        let percent = percent.min(100);
        let mut found = false;
        for (s, _, p) in entry.stages.iter_mut() {
            if *s == stage {
                *p = percent;
                found = true;
                break;
            }
        }
        if !found {
            return Err(Error::Validation(format!(
                "stage {:?} is not tracked",
                stage
            )));
        }

        let overall = entry.overall();
        drop(entry);
        let _ = self.events.send(ProgressEvent::Updated {
            tracker_id,
            stage,
            stage_percent: percent,
            overall,
        });
        Ok(())
    }

    /// Mark a tracker complete (overall 100) and schedule its removal
    pub fn complete(&self, tracker_id: Uuid) {
        if let Some(mut entry) = self.trackers.get_mut(&tracker_id) {
            for (_, _, p) in entry.stages.iter_mut() {
                *p = 100;
            }
            entry.completed = true;
        }
        let _ = self.events.send(ProgressEvent::Completed { tracker_id });
        self.schedule_removal(tracker_id);
    }

    /// Mark a tracker failed and schedule its removal
    pub fn fail(&self, tracker_id: Uuid, error: impl Into<String>) {
        let error = error.into();
        if let Some(mut entry) = self.trackers.get_mut(&tracker_id) {
            entry.completed = true;
            entry.error = Some(error.clone());
        }
        let _ = self.events.send(ProgressEvent::Failed { tracker_id, error });
        self.schedule_removal(tracker_id);
    }

    /// Status snapshot; `None` once the grace period has passed
    pub fn status(&self, tracker_id: Uuid) -> Option<TrackerStatus> {
        self.trackers.get(&tracker_id).map(|entry| TrackerStatus {
            tracker_id,
            stages: entry
                .stages
                .iter()
                .map(|&(stage, weight, percent)| StageStatus {
                    stage,
                    weight,
                    percent,
                })
                .collect(),
            overall: entry.overall(),
            eta_secs: entry.eta_secs(),
            completed: entry.completed,
            error: entry.error.clone(),
            created_at: entry.created_at,
        })
    }

    /// Subscribe to progress events
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// Number of live trackers
    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    /// Whether no trackers are live
    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    /// Keep terminal trackers pollable briefly, then discard them
    fn schedule_removal(&self, tracker_id: Uuid) {
        let trackers = Arc::clone(&self.trackers);
        let retention = self.retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            trackers.remove(&tracker_id);
        });
    }
}
