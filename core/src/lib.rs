pub mod batch;
pub mod config;
pub mod converter;
pub mod error;
pub mod events;
pub mod executor;
pub mod extractor;
pub mod history;
pub mod job;
pub mod playlist;
pub mod progress;
pub mod quality;
pub mod queue;
pub mod rate_limiter;
pub mod retry;
pub mod scheduler;
pub mod source;
pub mod utils;
pub mod ytdlp;

pub use batch::{Batch, BatchId, BatchKind, BatchProgress, BatchStatus};
pub use config::{EngineConfig, StopPolicy};
pub use converter::*;
pub use error::{BackendError, EngineError, ErrorKind, JobError, Result, TranscodeError};
pub use events::{QueueEvent, Subscription};
pub use extractor::*;
pub use history::{HistoryRecord, HistoryStore};
pub use job::{DownloadType, Job, JobId, JobProgress, JobState, Stage, TrimWindow};
pub use quality::*;
pub use queue::{QueueSnapshot, ResumeMode};
pub use rate_limiter::RateLimiter;
pub use retry::RetryPolicy;
pub use source::{DownloadOptions, PlaylistRange, Source, SourceDescriptor};
pub use utils::*;
pub use ytdlp::YtDlpBackend;

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::executor::ExecutorContext;
use crate::playlist::PlaylistExpander;
use crate::queue::QueueManager;
use crate::scheduler::Scheduler;

#[derive(Default)]
struct Lifecycle {
    scheduler: Option<(JoinHandle<()>, CancellationToken)>,
    expansions: Vec<JoinHandle<()>>,
    stopped: bool,
}

/// Download orchestration engine.
///
/// Owns the queue, the rate limiter and the worker pool. Jobs may be
/// submitted before `start`; nothing is dispatched until then.
pub struct Engine {
    config: Arc<EngineConfig>,
    queue: Arc<QueueManager>,
    limiter: Arc<RateLimiter>,
    backend: Arc<dyn ExtractionBackend>,
    transcoder: Arc<dyn MediaTranscoder>,
    lifecycle: Mutex<Lifecycle>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn ExtractionBackend>,
        transcoder: Arc<dyn MediaTranscoder>,
    ) -> Result<Self> {
        let config = config.normalized();
        let history = match &config.history_path {
            Some(path) => HistoryStore::open(path)?,
            None => HistoryStore::in_memory(),
        };
        let queue = QueueManager::new(config.observer_capacity, Arc::new(history));
        let limiter = RateLimiter::for_chunks(config.rate_limit_bytes_per_sec, config.chunk_size);

        Ok(Self {
            config: Arc::new(config),
            queue: Arc::new(queue),
            limiter: Arc::new(limiter),
            backend,
            transcoder,
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    /// Engine backed by the `yt-dlp` and `ffmpeg` executables.
    pub fn with_defaults(config: EngineConfig) -> Result<Self> {
        let backend = Arc::new(YtDlpBackend::from_config(&config));
        let transcoder = Arc::new(FfmpegTranscoder::new(&config.ffmpeg_path));
        Self::new(config, backend, transcoder)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start dispatching. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.stopped {
            return Err(EngineError::EngineStopped);
        }
        if lifecycle.scheduler.is_some() {
            return Ok(());
        }

        let scheduler = Scheduler::new(ExecutorContext {
            queue: self.queue.clone(),
            backend: self.backend.clone(),
            transcoder: self.transcoder.clone(),
            limiter: self.limiter.clone(),
            config: self.config.clone(),
            finalize_lock: Arc::new(tokio::sync::Mutex::new(())),
        });
        let shutdown = scheduler.shutdown_token();
        lifecycle.scheduler = Some((scheduler.spawn(), shutdown));
        info!(
            "Engine started: {} slots, rate limit {}",
            self.config.max_concurrent,
            self.limiter
                .rate()
                .map_or_else(|| "unlimited".to_string(), |r| format_speed(r as f64))
        );
        Ok(())
    }

    /// Cancel everything pending, then let active jobs finish or cancel them
    /// according to the stop policy, and release the worker slots.
    pub async fn stop(&self) {
        let (scheduler, expansions) = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.stopped {
                return;
            }
            lifecycle.stopped = true;
            (
                lifecycle.scheduler.take(),
                std::mem::take(&mut lifecycle.expansions),
            )
        };
        info!("Stopping engine ({:?})", self.config.stop_policy);

        let active = self.queue.close().await;
        if self.config.stop_policy == StopPolicy::ForceCancel {
            for (id, control) in &active {
                debug!("Cancelling job {} for shutdown", id);
                control.cancel.cancel();
            }
        }
        self.queue.wait_idle().await;

        if let Some((handle, shutdown)) = scheduler {
            shutdown.cancel();
            let _ = handle.await;
        }
        for expansion in expansions {
            let _ = expansion.await;
        }
        self.remove_scratch_dirs().await;
        self.queue.close_events();
        info!("Engine stopped");
    }

    /// Remove the partial-file directories once no executor can write to them.
    /// Directories still holding files (paused downloads) are left alone.
    async fn remove_scratch_dirs(&self) {
        let mut dirs: Vec<PathBuf> = self
            .queue
            .snapshot()
            .jobs
            .iter()
            .map(|job| self.config.temp_dir(&job.output_dir))
            .collect();
        dirs.push(self.config.temp_dir(&self.config.output_dir));
        dirs.sort();
        dirs.dedup();
        for dir in dirs {
            match tokio::fs::remove_dir(&dir).await {
                Ok(()) => debug!("Removed {:?}", dir),
                Err(e) => debug!("Keeping {:?}: {}", dir, e),
            }
        }
    }

    /// Validate a descriptor and create its batch. Playlists are expanded in
    /// the background; their jobs appear as the listing is processed.
    pub fn submit(&self, descriptor: SourceDescriptor) -> Result<BatchId> {
        descriptor.validate()?;
        if self.lifecycle.lock().stopped {
            return Err(EngineError::EngineStopped);
        }

        let request = descriptor.job_request(&self.config);
        let batch = Batch::new(descriptor.source.batch_kind(), descriptor.source.label());
        let batch_id = batch.id;
        let expansion = self.queue.open_batch(batch)?;

        match &descriptor.source {
            Source::Playlist(url) => {
                let expander = PlaylistExpander::new(
                    self.queue.clone(),
                    self.backend.clone(),
                    self.config.retry_policy(),
                    self.config.resolve_timeout(),
                );
                let handle = tokio::spawn(expander.expand(
                    batch_id,
                    url.trim().to_string(),
                    request,
                    descriptor.options.playlist_range,
                    expansion,
                ));
                let mut lifecycle = self.lifecycle.lock();
                lifecycle.expansions.retain(|h| !h.is_finished());
                lifecycle.expansions.push(handle);
            }
            Source::Video(_) | Source::UrlList(_) => {
                let jobs = descriptor
                    .direct_urls()
                    .into_iter()
                    .map(|url| Job::new(batch_id, url, &request))
                    .collect();
                self.queue.add_jobs(jobs)?;
            }
        }

        info!("Submitted batch {} ({})", batch_id, descriptor.source.label());
        Ok(batch_id)
    }

    pub async fn cancel_job(&self, id: JobId) -> Result<JobState> {
        self.queue.cancel_job(id).await
    }

    pub async fn cancel_batch(&self, id: BatchId) -> Result<usize> {
        self.queue.cancel_batch(id).await
    }

    pub async fn pause(&self, id: JobId) -> Result<ResumeMode> {
        self.queue.pause(id).await
    }

    pub fn resume(&self, id: JobId) -> Result<ResumeMode> {
        self.queue.resume(id)
    }

    /// Returns `false` when the job was already dispatched.
    pub fn reorder(&self, id: JobId, position: usize) -> Result<bool> {
        self.queue.reorder(id, position)
    }

    pub fn subscribe(&self) -> Subscription {
        self.queue.subscribe()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.queue.snapshot()
    }

    pub fn job(&self, id: JobId) -> Option<Job> {
        self.queue.job(id)
    }

    pub fn batch(&self, id: BatchId) -> Option<Batch> {
        self.queue.batch(id)
    }

    pub fn batch_progress(&self, id: BatchId) -> Option<BatchProgress> {
        self.queue.batch_progress(id)
    }

    pub async fn wait_for_batch(&self, id: BatchId) -> Result<BatchProgress> {
        self.queue.wait_for_batch(id).await
    }

    /// Remove finished jobs from the queue. History keeps them.
    pub fn purge_terminal(&self) -> usize {
        self.queue.purge_terminal()
    }

    pub fn history(&self) -> Vec<HistoryRecord> {
        self.queue.history().records()
    }

    pub fn purge_history(&self) -> Result<()> {
        self.queue.history().clear()
    }

    pub fn export_history(&self, dest: &Path) -> Result<usize> {
        self.queue.history().export(dest)
    }

    /// Metadata lookup without queueing anything.
    pub async fn resolve_info(&self, url: &str) -> std::result::Result<Metadata, BackendError> {
        self.backend.resolve_metadata(url).await
    }

    /// Qualities a single item offers.
    pub async fn available_qualities(
        &self,
        url: &str,
    ) -> std::result::Result<QualityOptions, BackendError> {
        match self.backend.resolve_metadata(url).await? {
            Metadata::Video(info) => Ok(analyze_available_qualities(&info)),
            Metadata::Playlist(list) => Err(BackendError::Unsupported(format!(
                "{} is a playlist; pick one of its items",
                list.title
            ))),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let lifecycle = self.lifecycle.get_mut();
        if let Some((_, shutdown)) = &lifecycle.scheduler {
            shutdown.cancel();
        }
        for expansion in &lifecycle.expansions {
            expansion.abort();
        }
    }
}
