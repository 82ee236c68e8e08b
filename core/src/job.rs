use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::batch::BatchId;
use crate::converter::AudioCodec;
use crate::error::{EngineError, JobError};
use crate::quality::FormatSelection;

/// Stable identifier of a Job for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle state of a Job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Resolving,
    Downloading,
    PostProcessing,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }

    /// States that occupy a worker slot.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobState::Resolving | JobState::Downloading | JobState::PostProcessing
        )
    }

    /// Edges of the job state machine. Terminal states have no outgoing edges.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, next),
            (Queued, Resolving)
                | (Queued, Cancelled)
                | (Queued, Paused)
                // playlist member whose listing entry cannot be downloaded
                | (Queued, Failed)
                | (Resolving, Downloading)
                | (Resolving, Failed)
                | (Resolving, Cancelled)
                | (Downloading, PostProcessing)
                | (Downloading, Completed)
                // retry after a transient failure
                | (Downloading, Downloading)
                | (Downloading, Failed)
                | (Downloading, Cancelled)
                | (Downloading, Paused)
                | (Paused, Downloading)
                | (Paused, Queued)
                | (Paused, Cancelled)
                | (PostProcessing, Completed)
                | (PostProcessing, Failed)
                | (PostProcessing, Cancelled)
                // single pipeline restart when the transcoder reports corrupted input
                | (PostProcessing, Downloading)
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            JobState::Queued => "Queued",
            JobState::Resolving => "Resolving",
            JobState::Downloading => "Downloading",
            JobState::PostProcessing => "Post-processing",
            JobState::Completed => "Completed",
            JobState::Failed => "Failed",
            JobState::Cancelled => "Cancelled",
            JobState::Paused => "Paused",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What streams a Job wants from the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DownloadType {
    #[default]
    VideoAudio,
    AudioOnly,
    VideoOnly,
}

impl FromStr for DownloadType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(['-', '_', ' ', '+'], "").as_str() {
            "videoaudio" | "video" | "av" | "both" => Ok(DownloadType::VideoAudio),
            "audioonly" | "audio" => Ok(DownloadType::AudioOnly),
            "videoonly" | "mute" => Ok(DownloadType::VideoOnly),
            other => Err(EngineError::InvalidDescriptor(format!(
                "unknown download type: {other}"
            ))),
        }
    }
}

/// Inclusive trim window in seconds from the start of the item.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrimWindow {
    pub start: f64,
    pub end: f64,
}

impl TrimWindow {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    /// Checks the parts that do not depend on the item: finite, non-negative, start < end.
    pub fn validate_shape(&self) -> Result<(), EngineError> {
        let ok = self.start.is_finite()
            && self.end.is_finite()
            && self.start >= 0.0
            && self.start < self.end;
        if ok {
            Ok(())
        } else {
            Err(EngineError::InvalidTrimRange {
                start: self.start,
                end: self.end,
            })
        }
    }

    /// Full check once the item duration is known: 0 <= start < end <= duration.
    pub fn validate(&self, duration: Option<f64>) -> Result<(), EngineError> {
        self.validate_shape()?;
        match duration {
            Some(duration) if self.end > duration => Err(EngineError::InvalidTrimRange {
                start: self.start,
                end: self.end,
            }),
            _ => Ok(()),
        }
    }

    pub fn length(&self) -> f64 {
        self.end - self.start
    }
}

/// Pipeline stage a progress report belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Resolve,
    Download,
    PostProcess,
    Finalize,
}

/// Per-job progress. Only meaningful while Downloading or PostProcessing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub stage: Stage,
    /// Download attempt this report belongs to; a retry starts a fresh stage instance.
    pub attempt: u32,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    /// 0.0 to 100.0 within the current stage.
    pub percent: f64,
    /// Smoothed bytes per second.
    pub speed_bps: f64,
    pub eta_secs: Option<u64>,
    pub elapsed_ms: u64,
}

impl JobProgress {
    pub fn starting(stage: Stage, attempt: u32) -> Self {
        Self {
            stage,
            attempt,
            downloaded_bytes: 0,
            total_bytes: None,
            percent: 0.0,
            speed_bps: 0.0,
            eta_secs: None,
            elapsed_ms: 0,
        }
    }

    /// Fold a newer report into this one without letting counters go backwards
    /// inside the same stage instance.
    pub fn merge_monotonic(&mut self, next: JobProgress) {
        if next.stage != self.stage || next.attempt != self.attempt {
            *self = next;
            return;
        }
        self.downloaded_bytes = self.downloaded_bytes.max(next.downloaded_bytes);
        self.percent = self.percent.max(next.percent);
        self.elapsed_ms = self.elapsed_ms.max(next.elapsed_ms);
        if next.total_bytes.is_some() {
            self.total_bytes = next.total_bytes;
        }
        self.speed_bps = next.speed_bps;
        self.eta_secs = next.eta_secs;
    }
}

/// One media item's download and processing request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub batch_id: BatchId,
    pub url: String,
    pub playlist_id: Option<String>,
    /// 1-based position inside the parent playlist.
    pub playlist_index: Option<usize>,
    pub download_type: DownloadType,
    pub selection: FormatSelection,
    pub trim: Option<TrimWindow>,
    pub audio_codec: AudioCodec,
    pub output_dir: PathBuf,
    pub output_template: String,
    pub state: JobState,
    pub progress: Option<JobProgress>,
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub duration: Option<f64>,
    /// Backend format selector chosen at Resolve.
    pub resolved_format: Option<String>,
    /// Short quality label of the resolved format, e.g. `720p` or `128k`.
    pub quality: Option<String>,
    /// Per-job scratch file; renamed into place only at Finalize.
    pub partial_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub error: Option<JobError>,
    pub retry_count: u32,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(batch_id: BatchId, url: impl Into<String>, request: &JobRequest) -> Self {
        Self {
            id: JobId::new(),
            batch_id,
            url: url.into(),
            playlist_id: None,
            playlist_index: None,
            download_type: request.download_type,
            selection: request.selection.clone(),
            trim: request.trim,
            audio_codec: request.audio_codec,
            output_dir: request.output_dir.clone(),
            output_template: request.output_template.clone(),
            state: JobState::Queued,
            progress: None,
            title: None,
            uploader: None,
            duration: None,
            resolved_format: None,
            quality: None,
            partial_path: None,
            output_path: None,
            error: None,
            retry_count: 0,
            attempt: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn in_playlist(mut self, playlist_id: impl Into<String>, index: usize) -> Self {
        self.playlist_id = Some(playlist_id.into());
        self.playlist_index = Some(index);
        self
    }

    pub fn with_title(mut self, title: Option<String>) -> Self {
        self.title = title;
        self
    }

    /// Trim or audio extraction need the transcoder after the raw download.
    pub fn needs_post_processing(&self) -> bool {
        self.trim.is_some() || self.download_type == DownloadType::AudioOnly
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.url)
    }
}

/// Per-job settings shared by every Job created from one source descriptor.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub download_type: DownloadType,
    pub selection: FormatSelection,
    pub trim: Option<TrimWindow>,
    pub audio_codec: AudioCodec,
    pub output_dir: PathBuf,
    pub output_template: String,
}
