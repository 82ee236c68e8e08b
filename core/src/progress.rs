use std::time::Duration;
use tokio::time::Instant;

use crate::batch::{Batch, BatchProgress, BatchStatus};
use crate::job::{Job, JobProgress, JobState, Stage};

/// Weight of the newest sample in the exponential moving average.
const SPEED_SMOOTHING: f64 = 0.3;

/// Smoothed transfer speed.
#[derive(Debug, Clone)]
pub struct SpeedMeter {
    smoothed: Option<f64>,
    last_sample: Option<(Instant, u64)>,
}

impl SpeedMeter {
    pub fn new() -> Self {
        Self {
            smoothed: None,
            last_sample: None,
        }
    }

    /// Feed the running byte total observed at `now`.
    pub fn sample(&mut self, now: Instant, total_bytes: u64) -> f64 {
        if let Some((at, bytes)) = self.last_sample {
            let dt = now.saturating_duration_since(at).as_secs_f64();
            if dt > 0.0 {
                let instant = total_bytes.saturating_sub(bytes) as f64 / dt;
                self.smoothed = Some(match self.smoothed {
                    Some(prev) => SPEED_SMOOTHING * instant + (1.0 - SPEED_SMOOTHING) * prev,
                    None => instant,
                });
                self.last_sample = Some((now, total_bytes));
            }
        } else {
            self.last_sample = Some((now, total_bytes));
        }
        self.speed()
    }

    pub fn speed(&self) -> f64 {
        self.smoothed.unwrap_or(0.0)
    }
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks one stage instance of one job and decides when a report is due.
///
/// A report is due when `interval` has passed since the last one or
/// `byte_step` bytes arrived since the last one, whichever comes first.
#[derive(Debug)]
pub struct ProgressTracker {
    stage: Stage,
    attempt: u32,
    started: Instant,
    interval: Duration,
    byte_step: u64,
    downloaded: u64,
    total: Option<u64>,
    percent_override: Option<f64>,
    last_emit: Option<(Instant, u64)>,
    meter: SpeedMeter,
}

impl ProgressTracker {
    pub fn new(stage: Stage, attempt: u32, interval: Duration, byte_step: u64) -> Self {
        let started = Instant::now();
        let mut meter = SpeedMeter::new();
        meter.sample(started, 0);
        Self {
            stage,
            attempt,
            started,
            interval,
            byte_step: byte_step.max(1),
            downloaded: 0,
            total: None,
            percent_override: None,
            last_emit: None,
            meter,
        }
    }

    /// Continue counting from a preserved byte offset.
    pub fn resume_from(&mut self, offset: u64) {
        self.downloaded = offset;
        self.meter = SpeedMeter::new();
        self.meter.sample(Instant::now(), offset);
    }

    pub fn set_total(&mut self, total: Option<u64>) {
        if total.is_some() {
            self.total = total;
        }
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    /// Count `bytes` more and return a report if one is due.
    pub fn advance(&mut self, bytes: u64) -> Option<JobProgress> {
        self.downloaded += bytes;
        let now = Instant::now();
        self.meter.sample(now, self.downloaded);
        if self.is_due(now) {
            Some(self.emit(now))
        } else {
            None
        }
    }

    /// Stage-relative percentage reported by a tool that does not count bytes.
    pub fn set_percent(&mut self, percent: f64) -> Option<JobProgress> {
        let percent = percent.clamp(0.0, 100.0);
        if self.percent_override.is_some_and(|p| p >= percent) {
            return None;
        }
        self.percent_override = Some(percent);
        let now = Instant::now();
        let due = self
            .last_emit
            .map_or(true, |(at, _)| now.saturating_duration_since(at) >= self.interval);
        if due || percent >= 100.0 {
            Some(self.emit(now))
        } else {
            None
        }
    }

    /// Report regardless of throttling, e.g. at the end of a stage.
    pub fn flush(&mut self) -> JobProgress {
        self.emit(Instant::now())
    }

    fn is_due(&self, now: Instant) -> bool {
        match self.last_emit {
            None => true,
            Some((at, bytes)) => {
                now.saturating_duration_since(at) >= self.interval
                    || self.downloaded.saturating_sub(bytes) >= self.byte_step
            }
        }
    }

    fn emit(&mut self, now: Instant) -> JobProgress {
        self.last_emit = Some((now, self.downloaded));
        let speed = self.meter.speed();
        let percent = match (self.percent_override, self.total) {
            (Some(p), _) => p,
            (None, Some(total)) if total > 0 => {
                (self.downloaded as f64 / total as f64 * 100.0).min(100.0)
            }
            _ => 0.0,
        };
        let eta_secs = self.total.and_then(|total| {
            (speed > 0.0).then(|| (total.saturating_sub(self.downloaded) as f64 / speed).ceil() as u64)
        });

        JobProgress {
            stage: self.stage,
            attempt: self.attempt,
            downloaded_bytes: self.downloaded,
            total_bytes: self.total,
            percent,
            speed_bps: speed,
            eta_secs,
            elapsed_ms: now.saturating_duration_since(self.started).as_millis() as u64,
        }
    }
}

/// Fraction of a job's work that is done, 0.0 to 1.0.
fn job_fraction(job: &Job) -> f64 {
    match job.state {
        JobState::Completed | JobState::Failed | JobState::Cancelled => 1.0,
        JobState::PostProcessing => 1.0,
        JobState::Downloading | JobState::Paused => job
            .progress
            .as_ref()
            .filter(|p| p.stage == Stage::Download)
            .map_or(0.0, |p| (p.percent / 100.0).clamp(0.0, 1.0)),
        JobState::Queued | JobState::Resolving => 0.0,
    }
}

/// Aggregate progress of a batch from the current state of its members.
///
/// Members are weighted by their byte size. Members whose size is unknown
/// count as the mean of the known sizes, or all count equally when no size is
/// known.
pub fn aggregate_batch<'a>(batch: &Batch, members: impl IntoIterator<Item = &'a Job>) -> BatchProgress {
    let members: Vec<&Job> = members.into_iter().collect();

    let known: Vec<u64> = members
        .iter()
        .filter_map(|job| job.progress.as_ref().and_then(|p| p.total_bytes))
        .filter(|&total| total > 0)
        .collect();
    let default_weight = if known.is_empty() {
        1.0
    } else {
        known.iter().sum::<u64>() as f64 / known.len() as f64
    };

    let mut progress = BatchProgress {
        total_jobs: members.len(),
        expanding: matches!(batch.status, BatchStatus::Expanding),
        ..Default::default()
    };

    let mut weight_sum = 0.0;
    let mut done_sum = 0.0;
    let mut latest_start = None;

    for job in &members {
        let weight = job
            .progress
            .as_ref()
            .and_then(|p| p.total_bytes)
            .filter(|&total| total > 0)
            .map_or(default_weight, |total| total as f64);
        weight_sum += weight;
        done_sum += weight * job_fraction(job);

        match job.state {
            JobState::Completed => progress.completed_jobs += 1,
            JobState::Failed => progress.failed_jobs += 1,
            JobState::Cancelled => progress.cancelled_jobs += 1,
            state if state.is_active() => {
                progress.active_jobs += 1;
                if let Some(p) = &job.progress {
                    progress.speed_bps += p.speed_bps;
                }
                if job.started_at >= latest_start {
                    latest_start = job.started_at;
                    progress.current_item = Some(job.display_name().to_string());
                }
            }
            _ => {}
        }

        if let Some(p) = &job.progress {
            if !job.state.is_terminal() || job.state == JobState::Completed {
                progress.downloaded_bytes += p.downloaded_bytes;
            }
        }
    }

    if weight_sum > 0.0 {
        progress.overall_progress = (done_sum / weight_sum * 100.0).clamp(0.0, 100.0);
    } else if !progress.expanding {
        progress.overall_progress = 100.0;
    }

    if progress.speed_bps > 0.0 && known.len() == members.len() && !members.is_empty() {
        let remaining = weight_sum - done_sum;
        progress.eta_secs = Some((remaining / progress.speed_bps).ceil() as u64);
    }

    progress
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchKind;
    use crate::job::JobRequest;
    use crate::quality::FormatSelection;
    use std::path::PathBuf;

    fn job(batch: &Batch, state: JobState, total: Option<u64>, percent: f64) -> Job {
        let request = JobRequest {
            download_type: Default::default(),
            selection: FormatSelection::default(),
            trim: None,
            audio_codec: Default::default(),
            output_dir: PathBuf::from("/tmp"),
            output_template: "{title}.{ext}".into(),
        };
        let mut job = Job::new(batch.id, "https://example.com/v", &request);
        job.state = state;
        let mut progress = JobProgress::starting(Stage::Download, 1);
        progress.total_bytes = total;
        progress.percent = percent;
        job.progress = Some(progress);
        job
    }

    #[tokio::test(start_paused = true)]
    async fn speed_is_smoothed() {
        let mut meter = SpeedMeter::new();
        let start = Instant::now();
        meter.sample(start, 0);
        let first = meter.sample(start + Duration::from_secs(1), 1000);
        assert_eq!(first, 1000.0);

        let second = meter.sample(start + Duration::from_secs(2), 4000);
        // 0.3 * 3000 + 0.7 * 1000
        assert!((second - 1600.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn reports_are_throttled_by_time_and_bytes() {
        let mut tracker = ProgressTracker::new(Stage::Download, 1, Duration::from_millis(250), 1000);
        tracker.set_total(Some(10_000));

        assert!(tracker.advance(10).is_some(), "first chunk always reports");
        assert!(tracker.advance(10).is_none());

        let by_bytes = tracker.advance(1000).expect("byte step reached");
        assert_eq!(by_bytes.downloaded_bytes, 1020);

        tokio::time::advance(Duration::from_millis(300)).await;
        let by_time = tracker.advance(1).expect("interval elapsed");
        assert_eq!(by_time.downloaded_bytes, 1021);
        assert!(by_time.elapsed_ms >= 300);
    }

    #[tokio::test(start_paused = true)]
    async fn percent_and_eta_follow_total() {
        let mut tracker = ProgressTracker::new(Stage::Download, 2, Duration::ZERO, 1);
        tracker.set_total(Some(1000));
        tokio::time::advance(Duration::from_secs(1)).await;
        let report = tracker.advance(500).unwrap();
        assert_eq!(report.attempt, 2);
        assert_eq!(report.percent, 50.0);
        assert_eq!(report.eta_secs, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn tool_percent_never_goes_backwards() {
        let mut tracker = ProgressTracker::new(Stage::PostProcess, 1, Duration::ZERO, 1);
        assert_eq!(tracker.set_percent(40.0).unwrap().percent, 40.0);
        assert!(tracker.set_percent(30.0).is_none());
        assert_eq!(tracker.set_percent(100.0).unwrap().percent, 100.0);
    }

    #[test]
    fn aggregate_weights_by_bytes() {
        let batch = Batch::new(BatchKind::UrlList, "list");
        let jobs = vec![
            job(&batch, JobState::Completed, Some(300), 100.0),
            job(&batch, JobState::Downloading, Some(100), 50.0),
        ];
        let progress = aggregate_batch(&batch, &jobs);
        assert_eq!(progress.total_jobs, 2);
        assert_eq!(progress.completed_jobs, 1);
        assert_eq!(progress.active_jobs, 1);
        // (300 + 50) / 400
        assert!((progress.overall_progress - 87.5).abs() < 1e-9);
    }

    #[test]
    fn unknown_sizes_count_as_the_mean_known_size() {
        let batch = Batch::new(BatchKind::UrlList, "list");
        let jobs = vec![
            job(&batch, JobState::Completed, Some(200), 100.0),
            job(&batch, JobState::Queued, None, 0.0),
        ];
        let progress = aggregate_batch(&batch, &jobs);
        assert!((progress.overall_progress - 50.0).abs() < 1e-9);
        assert!(progress.eta_secs.is_none());
    }

    #[test]
    fn failed_members_do_not_block_completion() {
        let batch = Batch::new(BatchKind::Playlist, "pl");
        let mut ready = batch.clone();
        ready.status = BatchStatus::Ready;
        let jobs = vec![
            job(&ready, JobState::Completed, None, 100.0),
            job(&ready, JobState::Failed, None, 0.0),
        ];
        let progress = aggregate_batch(&ready, &jobs);
        assert!(progress.is_finished());
        assert_eq!(progress.overall_progress, 100.0);

        assert!(!aggregate_batch(&batch, &jobs).is_finished());
    }
}
