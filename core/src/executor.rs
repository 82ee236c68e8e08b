use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::converter::{MediaTranscoder, TargetCodec, TranscodeRequest};
use crate::error::{io_job_error, ErrorKind, JobError, TranscodeError};
use crate::extractor::{extract_video_id, ExtractionBackend, Metadata, MediaStream, StreamRequest, VideoInfo};
use crate::job::{DownloadType, Job, JobProgress, JobState, Stage};
use crate::progress::ProgressTracker;
use crate::quality::plan_format;
use crate::queue::{DispatchTicket, JobControl, QueueManager, ResumeMode};
use crate::rate_limiter::RateLimiter;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::utils::{ensure_directory_exists, is_within, render_template, unique_path, TemplateValues};

/// Everything an executor needs, shared by all executors of one engine.
#[derive(Clone)]
pub struct ExecutorContext {
    pub queue: Arc<QueueManager>,
    pub backend: Arc<dyn ExtractionBackend>,
    pub transcoder: Arc<dyn MediaTranscoder>,
    pub limiter: Arc<RateLimiter>,
    pub config: Arc<EngineConfig>,
    /// Serializes picking a free destination name and moving into it.
    pub finalize_lock: Arc<tokio::sync::Mutex<()>>,
}

/// Why a job stopped before completing.
#[derive(Debug)]
enum Halt {
    Cancelled,
    Paused(ResumeMode),
    Failed(JobError),
}

impl From<JobError> for Halt {
    fn from(err: JobError) -> Self {
        if err.is_cancelled() {
            Halt::Cancelled
        } else {
            Halt::Failed(err)
        }
    }
}

/// Drives one job through resolve, download, post-process and finalize.
pub struct JobExecutor {
    ctx: ExecutorContext,
    job: Job,
    control: JobControl,
    resume: Option<ResumeMode>,
    retry: RetryPolicy,
    /// Files this run created that must not outlive a failed job.
    scratch: Vec<PathBuf>,
}

impl JobExecutor {
    pub fn new(ctx: ExecutorContext, ticket: DispatchTicket) -> Self {
        let retry = ctx.config.retry_policy();
        Self {
            ctx,
            job: ticket.job,
            control: ticket.control,
            resume: ticket.resume,
            retry,
            scratch: Vec::new(),
        }
    }

    pub async fn run(mut self) {
        let id = self.job.id;
        match self.drive().await {
            Ok(()) => {}
            Err(Halt::Paused(mode)) => {
                info!("Job {} paused ({:?})", id, mode);
                if let Err(e) = self.ctx.queue.mark_paused(id, mode) {
                    warn!("Could not record pause of job {}: {}", id, e);
                }
            }
            Err(Halt::Cancelled) => {
                self.discard_scratch().await;
                if let Err(e) = self.ctx.queue.transition(id, JobState::Cancelled, |job| {
                    job.error = Some(JobError::cancelled());
                    job.partial_path = None;
                }) {
                    warn!("Could not record cancellation of job {}: {}", id, e);
                }
            }
            Err(Halt::Failed(err)) => {
                warn!("Job {} failed: {}", id, err);
                self.discard_scratch().await;
                if let Err(e) = self.ctx.queue.transition(id, JobState::Failed, |job| {
                    job.error = Some(err);
                    job.partial_path = None;
                }) {
                    warn!("Could not record failure of job {}: {}", id, e);
                }
            }
        }
    }

    async fn drive(&mut self) -> Result<(), Halt> {
        let mut offset = match self.resume.take() {
            None => {
                self.resolve().await?;
                0
            }
            Some(mode) => self.prepare_resume(mode).await?,
        };

        let mut restarted = false;
        let output = loop {
            self.download(offset).await?;
            offset = 0;

            if !self.job.needs_post_processing() {
                break self.partial_path()?;
            }
            self.job = self.enter(JobState::PostProcessing, |job| {
                job.progress = Some(JobProgress::starting(Stage::PostProcess, job.attempt));
            })?;
            if let Some(pause) = self.ctx.queue.renew_pause(self.job.id) {
                self.control.pause = pause;
            }
            match self.post_process().await {
                Ok(processed) => break processed,
                Err(err) if err.is_corrupted_input() && !restarted => {
                    warn!("Job {}: downloaded file is unreadable, downloading again: {}", self.job.id, err);
                    restarted = true;
                    self.restart_download()?;
                }
                Err(TranscodeError::Cancelled) => return Err(Halt::Cancelled),
                Err(err) => return Err(Halt::Failed(err.to_job_error())),
            }
        };

        self.finalize(output).await
    }

    // ----- resolve -----

    async fn resolve(&mut self) -> Result<(), Halt> {
        let info = self.resolve_with_retry().await?;

        if let Some(trim) = self.job.trim {
            trim.validate(info.duration)
                .map_err(|e| Halt::Failed(JobError::new(ErrorKind::Permanent, e.to_string())))?;
        }
        let plan = plan_format(&info, self.job.download_type, &self.job.selection)
            .map_err(|e| Halt::Failed(e.to_job_error()))?;
        debug!("Job {}: format {} as .{}", self.job.id, plan.selector, plan.ext);

        let partial = self
            .ctx
            .config
            .temp_dir(&self.job.output_dir)
            .join(format!("{}.{}", self.job.id, plan.ext));

        self.job = self.enter(JobState::Downloading, |job| {
            job.title = Some(info.title.clone());
            job.uploader = info.uploader.clone();
            job.duration = info.duration;
            job.resolved_format = Some(plan.selector.clone());
            job.quality = Some(plan.quality_label.clone());
            job.partial_path = Some(partial);
            job.attempt = 1;
            let mut progress = JobProgress::starting(Stage::Download, 1);
            progress.total_bytes = plan.estimated_size;
            job.progress = Some(progress);
        })?;
        Ok(())
    }

    async fn resolve_with_retry(&mut self) -> Result<VideoInfo, Halt> {
        let timeout = self.ctx.config.resolve_timeout();
        let mut attempt = 1;
        loop {
            let result = tokio::select! {
                biased;
                _ = self.control.cancel.cancelled() => return Err(Halt::Cancelled),
                r = tokio::time::timeout(timeout, self.ctx.backend.resolve_metadata(&self.job.url)) => r,
            };

            let err = match result {
                Ok(Ok(Metadata::Video(info))) => return Ok(info),
                Ok(Ok(Metadata::Playlist(list))) => JobError::new(
                    ErrorKind::Permanent,
                    format!("{} is a playlist ({}); submit it as a playlist", self.job.url, list.title),
                ),
                Ok(Err(e)) => e.to_job_error(),
                Err(_) => JobError::new(
                    ErrorKind::Transient,
                    format!("metadata lookup timed out after {}s", timeout.as_secs()),
                ),
            };

            match self.retry.decide(attempt, err) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        "Job {}: metadata attempt {} failed, retrying in {:?}",
                        self.job.id, attempt, delay
                    );
                    if let Some(job) = self.ctx.queue.update_job(self.job.id, |job| job.retry_count += 1) {
                        self.job = job;
                    }
                    self.backoff(delay, None).await?;
                    attempt += 1;
                }
                RetryDecision::GiveUp(err) => return Err(err.into()),
            }
        }
    }

    // ----- download -----

    /// Set up a paused download that was just dispatched again.
    async fn prepare_resume(&mut self, mode: ResumeMode) -> Result<u64, Halt> {
        let partial = self.partial_path()?;
        let offset = match mode {
            ResumeMode::Continue { offset } => {
                let on_disk = fs::metadata(&partial).await.map(|m| m.len()).unwrap_or(0);
                if on_disk == offset {
                    offset
                } else {
                    warn!(
                        "Job {}: partial file has {} bytes, expected {}; starting over",
                        self.job.id, on_disk, offset
                    );
                    0
                }
            }
            ResumeMode::Restart => 0,
        };

        if offset == 0 {
            // a new stage instance: progress starts again from zero
            if let Some(job) = self.ctx.queue.update_job(self.job.id, |job| {
                job.attempt += 1;
                job.progress = Some(JobProgress::starting(Stage::Download, job.attempt));
            }) {
                self.job = job;
            }
        }
        info!("Resuming job {} at byte {}", self.job.id, offset);
        Ok(offset)
    }

    async fn download(&mut self, mut offset: u64) -> Result<(), Halt> {
        let supports_resume = self.ctx.backend.supports_resume();
        let mut failures = 1;
        loop {
            let err = match self.transfer(offset).await {
                Ok(bytes) => {
                    info!("Job {}: downloaded {} bytes", self.job.id, bytes);
                    return Ok(());
                }
                Err(Halt::Failed(err)) => err,
                Err(halt) => return Err(halt),
            };

            match self.retry.decide(failures, err) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        "Job {}: download attempt {} failed, retrying in {:?}",
                        self.job.id, self.job.attempt, delay
                    );
                    offset = if supports_resume {
                        self.partial_len().await
                    } else {
                        self.discard_partial().await;
                        0
                    };
                    self.backoff(delay, Some(offset)).await?;
                    failures += 1;
                    self.job = self.enter(JobState::Downloading, |job| {
                        job.attempt += 1;
                        job.retry_count += 1;
                        job.progress = Some(JobProgress::starting(Stage::Download, job.attempt));
                    })?;
                }
                RetryDecision::GiveUp(err) => return Err(err.into()),
            }
        }
    }

    /// One pass over the stream. Returns the total bytes in the partial file.
    async fn transfer(&mut self, offset: u64) -> Result<u64, Halt> {
        let id = self.job.id;
        let partial = self.partial_path()?;
        if let Some(dir) = partial.parent() {
            ensure_directory_exists(dir)
                .await
                .map_err(|e| Halt::Failed(io_job_error("creating the temporary directory", &e)))?;
        }
        self.track_scratch(&partial);

        let mut file = if offset > 0 {
            OpenOptions::new().append(true).open(&partial).await
        } else {
            File::create(&partial).await
        }
        .map_err(|e| Halt::Failed(io_job_error("opening the partial file", &e)))?;

        let timeout = self.ctx.config.network_timeout();
        let request = StreamRequest {
            url: self.job.url.clone(),
            format: self.job.resolved_format.clone().unwrap_or_else(|| "best".to_string()),
            offset,
        };
        let mut stream = tokio::select! {
            biased;
            _ = self.control.cancel.cancelled() => return Err(Halt::Cancelled),
            r = tokio::time::timeout(timeout, self.ctx.backend.open_stream(request)) => match r {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(Halt::Failed(e.to_job_error())),
                Err(_) => return Err(Halt::Failed(timed_out("opening the stream", timeout))),
            },
        };

        let config = &self.ctx.config;
        let mut tracker = ProgressTracker::new(
            Stage::Download,
            self.job.attempt.max(1),
            config.progress_interval(),
            config.progress_byte_step,
        );
        tracker.resume_from(offset);
        tracker.set_total(
            stream
                .total_bytes()
                .or_else(|| self.job.progress.as_ref().and_then(|p| p.total_bytes)),
        );

        loop {
            // checkpoint: every byte read so far is on disk
            if self.control.cancel.is_cancelled() {
                return Err(Halt::Cancelled);
            }
            if self.control.pause.is_cancelled() {
                flush(&mut file).await?;
                drop(file);
                drop(stream);
                return Err(Halt::Paused(self.pause_mode(tracker.downloaded()).await));
            }

            let token = tokio::select! {
                biased;
                _ = self.control.cancel.cancelled() => return Err(Halt::Cancelled),
                _ = self.control.pause.cancelled() => continue,
                token = self.ctx.limiter.acquire(config.chunk_size as u64) => token,
            };

            let read = tokio::select! {
                biased;
                _ = self.control.cancel.cancelled() => {
                    self.ctx.limiter.refund(token.bytes());
                    return Err(Halt::Cancelled);
                }
                _ = self.control.pause.cancelled() => {
                    self.ctx.limiter.refund(token.bytes());
                    continue;
                }
                r = tokio::time::timeout(timeout, stream.next_chunk(token.bytes() as usize)) => r,
            };

            match read {
                Ok(Ok(Some(chunk))) => {
                    let len = chunk.len() as u64;
                    self.ctx.limiter.settle(token, len);
                    file.write_all(&chunk)
                        .await
                        .map_err(|e| Halt::Failed(io_job_error("writing the partial file", &e)))?;
                    if let Some(progress) = tracker.advance(len) {
                        self.ctx.queue.report_progress(id, progress);
                    }
                }
                Ok(Ok(None)) => {
                    self.ctx.limiter.settle(token, 0);
                    break;
                }
                Ok(Err(e)) => {
                    self.ctx.limiter.settle(token, 0);
                    flush(&mut file).await?;
                    return Err(Halt::Failed(e.to_job_error()));
                }
                Err(_) => {
                    self.ctx.limiter.settle(token, 0);
                    flush(&mut file).await?;
                    return Err(Halt::Failed(timed_out("waiting for data", timeout)));
                }
            }
        }

        flush(&mut file).await?;
        drop(file);
        self.finish_stream(stream).await?;

        self.ctx.queue.report_progress(id, tracker.flush());
        Ok(tracker.downloaded())
    }

    async fn finish_stream(&self, stream: Box<dyn MediaStream>) -> Result<(), Halt> {
        tokio::select! {
            biased;
            _ = self.control.cancel.cancelled() => Err(Halt::Cancelled),
            r = stream.finish() => r.map_err(|e| Halt::Failed(e.to_job_error())),
        }
    }

    /// Keep the partial file when the backend can continue from it.
    async fn pause_mode(&self, downloaded: u64) -> ResumeMode {
        if self.ctx.backend.supports_resume() {
            ResumeMode::Continue { offset: downloaded }
        } else {
            self.discard_partial().await;
            ResumeMode::Restart
        }
    }

    /// Wait before a retry. A pause during the wait parks the job.
    async fn backoff(&self, delay: Duration, offset: Option<u64>) -> Result<(), Halt> {
        tokio::select! {
            biased;
            _ = self.control.cancel.cancelled() => Err(Halt::Cancelled),
            _ = self.control.pause.cancelled(), if offset.is_some() => {
                Err(Halt::Paused(self.pause_mode(offset.unwrap_or_default()).await))
            }
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn restart_download(&mut self) -> Result<(), Halt> {
        self.job = self.enter(JobState::Downloading, |job| {
            job.attempt += 1;
            job.progress = Some(JobProgress::starting(Stage::Download, job.attempt));
        })?;
        Ok(())
    }

    // ----- post-process -----

    async fn post_process(&mut self) -> Result<PathBuf, TranscodeError> {
        let id = self.job.id;
        let input = self
            .partial_path()
            .map_err(|_| TranscodeError::Failed("no downloaded file to process".into()))?;
        let raw_ext = input
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();
        let target = match self.job.download_type {
            DownloadType::AudioOnly => TargetCodec::Audio(self.job.audio_codec),
            DownloadType::VideoAudio | DownloadType::VideoOnly => TargetCodec::Keep,
        };
        let output = input.with_extension(format!("processed.{}", target.extension(&raw_ext)));
        self.track_scratch(&output);

        let config = &self.ctx.config;
        let tracker = Mutex::new(ProgressTracker::new(
            Stage::PostProcess,
            self.job.attempt,
            config.progress_interval(),
            u64::MAX,
        ));
        let queue = self.ctx.queue.clone();
        let report = move |percent: f64| {
            if let Some(progress) = tracker.lock().set_percent(percent) {
                queue.report_progress(id, progress);
            }
        };

        let request = TranscodeRequest {
            input: input.clone(),
            output: output.clone(),
            trim: self.job.trim,
            target,
            duration: self.job.duration,
        };
        info!("Job {}: post-processing {:?}", id, input);
        let result = self
            .ctx
            .transcoder
            .transcode(request, &report, &self.control.cancel)
            .await;

        match result {
            Ok(()) => {
                remove_file(&input).await;
                Ok(output)
            }
            Err(err) => {
                remove_file(&output).await;
                if err.is_corrupted_input() {
                    remove_file(&input).await;
                }
                Err(err)
            }
        }
    }

    // ----- finalize -----

    async fn finalize(&mut self, source: PathBuf) -> Result<(), Halt> {
        if self.control.cancel.is_cancelled() {
            return Err(Halt::Cancelled);
        }

        let ext = source
            .extension()
            .map(|e| e.to_string_lossy().into_owned());
        let values = TemplateValues {
            title: self.job.title.clone(),
            uploader: self.job.uploader.clone(),
            index: self.job.playlist_index,
            ext,
            quality: self.job.quality.clone(),
            id: extract_video_id(&self.job.url),
        };
        let target = self
            .job
            .output_dir
            .join(render_template(&self.job.output_template, &values));
        if !is_within(&self.job.output_dir, &target) {
            return Err(Halt::Failed(JobError::new(
                ErrorKind::Permanent,
                format!("output name {:?} leaves the output directory", target),
            )));
        }
        if let Some(dir) = target.parent() {
            ensure_directory_exists(dir)
                .await
                .map_err(|e| Halt::Failed(io_job_error("creating the output directory", &e)))?;
        }

        let destination = {
            let _guard = self.ctx.finalize_lock.lock().await;
            let destination = unique_path(&target);
            move_into_place(&source, &destination)
                .await
                .map_err(|e| Halt::Failed(io_job_error("moving the file into place", &e)))?;
            destination
        };
        info!("Job {} saved to {:?}", self.job.id, destination);

        self.job = self.enter(JobState::Completed, |job| {
            job.output_path = Some(destination);
            job.partial_path = None;
            job.error = None;
        })?;
        Ok(())
    }

    // ----- helpers -----

    fn enter(&self, to: JobState, apply: impl FnOnce(&mut Job)) -> Result<Job, Halt> {
        self.ctx
            .queue
            .transition(self.job.id, to, apply)
            .map_err(|e| Halt::Failed(JobError::new(ErrorKind::Permanent, e.to_string())))
    }

    fn partial_path(&self) -> Result<PathBuf, Halt> {
        self.job.partial_path.clone().ok_or_else(|| {
            Halt::Failed(JobError::new(ErrorKind::Permanent, "job has no partial file"))
        })
    }

    async fn partial_len(&self) -> u64 {
        match &self.job.partial_path {
            Some(path) => fs::metadata(path).await.map(|m| m.len()).unwrap_or(0),
            None => 0,
        }
    }

    fn track_scratch(&mut self, path: &Path) {
        if !self.scratch.iter().any(|p| p == path) {
            self.scratch.push(path.to_path_buf());
        }
    }

    async fn discard_partial(&self) {
        if let Some(path) = &self.job.partial_path {
            remove_file(path).await;
        }
    }

    async fn discard_scratch(&mut self) {
        self.discard_partial().await;
        for path in self.scratch.drain(..) {
            remove_file(&path).await;
        }
    }
}

fn timed_out(what: &str, after: Duration) -> JobError {
    JobError::new(
        ErrorKind::Transient,
        format!("timed out {} after {}s", what, after.as_secs()),
    )
}

async fn flush(file: &mut File) -> Result<(), Halt> {
    file.flush()
        .await
        .map_err(|e| Halt::Failed(io_job_error("writing the partial file", &e)))
}

async fn remove_file(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!("Removed {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {:?}: {}", path, e),
    }
}

/// Atomic rename, or copy and delete when the paths are on different filesystems.
async fn move_into_place(source: &Path, destination: &Path) -> std::io::Result<()> {
    match fs::rename(source, destination).await {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            debug!("rename failed ({}), copying instead", rename_err);
            if let Err(e) = fs::copy(source, destination).await {
                let _ = fs::remove_file(destination).await;
                return Err(e);
            }
            fs::remove_file(source).await
        }
    }
}
