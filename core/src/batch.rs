use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::JobError;
use crate::job::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BatchId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// What kind of source descriptor produced the batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchKind {
    Single,
    Playlist,
    UrlList,
}

/// Batch-level status, distinct from the states of its member jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BatchStatus {
    /// Playlist listing still running; members may still appear.
    Expanding,
    Ready,
    /// Listing failed outright. The batch has no members.
    Failed(JobError),
    Cancelled,
}

impl BatchStatus {
    pub fn is_expanding(&self) -> bool {
        matches!(self, BatchStatus::Expanding)
    }
}

/// Jobs submitted together. Holds job ids only; the queue owns the jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub kind: BatchKind,
    /// URL or label the user submitted.
    pub source: String,
    /// Playlist title once the listing is known.
    pub title: Option<String>,
    pub status: BatchStatus,
    pub job_ids: Vec<JobId>,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(kind: BatchKind, source: impl Into<String>) -> Self {
        let status = match kind {
            BatchKind::Playlist => BatchStatus::Expanding,
            BatchKind::Single | BatchKind::UrlList => BatchStatus::Ready,
        };

        Self {
            id: BatchId::new(),
            kind,
            source: source.into(),
            title: None,
            status,
            job_ids: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

/// Aggregate progress for a batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    /// 0.0 to 100.0, weighted by bytes where sizes are known.
    pub overall_progress: f64,
    pub total_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub cancelled_jobs: usize,
    pub active_jobs: usize,
    pub downloaded_bytes: u64,
    /// Sum of smoothed speeds of the active members.
    pub speed_bps: f64,
    pub eta_secs: Option<u64>,
    /// Title of the most recently started active member.
    pub current_item: Option<String>,
    pub expanding: bool,
}

impl BatchProgress {
    pub fn finished_jobs(&self) -> usize {
        self.completed_jobs + self.failed_jobs + self.cancelled_jobs
    }

    pub fn is_finished(&self) -> bool {
        !self.expanding && self.finished_jobs() == self.total_jobs
    }
}
