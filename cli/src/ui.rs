use colored::*;
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use ytgrab_core::*;

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{prefix:>15.bold} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {wide_msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏ ")
}

fn percent_style() -> ProgressStyle {
    ProgressStyle::with_template("{prefix:>15.bold} [{bar:30.magenta/blue}] {percent:>3}% {wide_msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏ ")
}

fn waiting_style() -> ProgressStyle {
    ProgressStyle::with_template("{prefix:>15.bold} {spinner} {wide_msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// One bar per job, fed only by queue events.
pub struct ProgressView {
    multi: MultiProgress,
    bars: HashMap<JobId, ProgressBar>,
}

impl ProgressView {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::with_draw_target(ProgressDrawTarget::stderr()),
            bars: HashMap::new(),
        }
    }

    /// Render until the subscription ends.
    pub async fn run(mut self, mut events: Subscription) {
        while let Some(event) = events.recv().await {
            self.apply(event);
        }
        for bar in self.bars.values() {
            if !bar.is_finished() {
                bar.abandon();
            }
        }
        if events.coalesced() > 0 {
            tracing::debug!("{} progress updates skipped while rendering", events.coalesced());
        }
    }

    fn apply(&mut self, event: QueueEvent) {
        match event {
            QueueEvent::JobAdded { job } => {
                let bar = self.multi.add(ProgressBar::new_spinner());
                bar.set_style(waiting_style());
                bar.set_prefix(job.state.label());
                bar.set_message(job.display_name().to_string());
                if job.state.is_terminal() {
                    finish_bar(&bar, job.state, job.error.as_ref());
                }
                self.bars.insert(job.id, bar);
            }
            QueueEvent::JobUpdated { job } => {
                if let Some(bar) = self.bars.get(&job.id) {
                    bar.set_message(job.display_name().to_string());
                }
            }
            QueueEvent::StateChanged { job_id, to, error, .. } => {
                let Some(bar) = self.bars.get(&job_id) else { return };
                bar.set_prefix(to.label());
                match to {
                    JobState::Resolving | JobState::Paused | JobState::Queued => {
                        bar.set_style(waiting_style());
                    }
                    JobState::Downloading => {
                        bar.set_style(bar_style());
                        bar.set_position(0);
                    }
                    JobState::PostProcessing => {
                        bar.set_style(percent_style());
                        bar.set_length(100);
                        bar.set_position(0);
                    }
                    JobState::Completed | JobState::Failed | JobState::Cancelled => {
                        finish_bar(bar, to, error.as_ref());
                    }
                }
            }
            QueueEvent::Progress { job_id, progress } => {
                let Some(bar) = self.bars.get(&job_id) else { return };
                match progress.stage {
                    Stage::Download => {
                        if let Some(total) = progress.total_bytes {
                            bar.set_length(total);
                        }
                        bar.set_position(progress.downloaded_bytes);
                    }
                    Stage::PostProcess => bar.set_position(progress.percent.round() as u64),
                    Stage::Resolve | Stage::Finalize => {}
                }
            }
            QueueEvent::JobRemoved { job_id } => {
                if let Some(bar) = self.bars.remove(&job_id) {
                    self.multi.remove(&bar);
                }
            }
            QueueEvent::Reordered { .. } => {}
            QueueEvent::BatchChanged { status, job_count, .. } => {
                if let BatchStatus::Failed(err) = status {
                    let _ = self.multi.println(format!("❌ {}", err.message.red()));
                } else if !status.is_expanding() {
                    tracing::debug!("Batch {:?} with {} jobs", status, job_count);
                }
            }
        }
    }
}

fn finish_bar(bar: &ProgressBar, state: JobState, error: Option<&JobError>) {
    bar.set_style(waiting_style());
    let name = bar.message();
    let message = match (state, error) {
        (JobState::Completed, _) => format!("✅ {}", name.green()),
        (JobState::Cancelled, _) => format!("⏹️  {}", name.yellow()),
        (_, Some(err)) => format!("❌ {}: {}", name, err.message.red()),
        (_, None) => format!("❌ {}", name),
    };
    bar.finish_with_message(message);
}

pub fn display_metadata(metadata: &Metadata) {
    match metadata {
        Metadata::Video(info) => display_video_info(info),
        Metadata::Playlist(list) => display_playlist_info(list),
    }
}

pub fn display_video_info(info: &VideoInfo) {
    println!("{}", style("📹 Video Information").cyan().bold());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Title:     {}", info.title.green());
    if let Some(uploader) = &info.uploader {
        println!("Uploader:  {}", uploader);
    }
    if let Some(duration) = info.duration {
        println!("Duration:  {}", format_duration(duration as u64));
    }
    if let Some(views) = info.view_count {
        println!("Views:     {}", views.to_string().yellow());
    }
    if let Some(date) = &info.upload_date {
        println!("Uploaded:  {}", date);
    }
    println!("Formats:   {}", info.formats.len());
}

pub fn display_playlist_info(list: &PlaylistInfo) {
    println!("{}", style("📋 Playlist Information").cyan().bold());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Title:     {}", list.title.green());
    if let Some(uploader) = &list.uploader {
        println!("Uploader:  {}", uploader);
    }
    println!("Videos:    {}", list.entries.len().to_string().yellow());
    println!();
    for (i, entry) in list.entries.iter().enumerate() {
        let title = entry.title.as_deref().unwrap_or("(untitled)");
        let duration = entry
            .duration
            .map(|d| format_duration(d as u64))
            .unwrap_or_default();
        match &entry.unavailable {
            Some(reason) => println!("{:>4}. {} {}", i + 1, title.dimmed(), format!("({reason})").red()),
            None => println!("{:>4}. {} {}", i + 1, title, duration.dimmed()),
        }
    }
}

pub fn display_quality_options(options: &QualityOptions, audio_only: bool, video_only: bool) {
    if !audio_only {
        println!("{}", style("🎬 Video Qualities").cyan().bold());
        for q in &options.video_qualities {
            println!(
                "   {:>8}  {:>6}  {:<12} {:<5} {:>10}",
                q.format_id,
                q.resolution.green(),
                q.codec,
                q.ext,
                q.file_size.map(format_bytes).unwrap_or_default()
            );
        }
        println!();
    }
    if !video_only {
        println!("{}", style("🎵 Audio Qualities").cyan().bold());
        for q in &options.audio_qualities {
            println!(
                "   {:>8}  {:>6}  {:<12} {:<5} {:>10}",
                q.format_id,
                format!("{}k", q.bitrate).green(),
                q.codec,
                q.ext,
                q.file_size.map(format_bytes).unwrap_or_default()
            );
        }
        println!();
    }
    let presets: Vec<&str> = options.presets.iter().map(|p| p.label()).collect();
    println!("Presets: {}", presets.join(", ").yellow());
}

pub fn display_history(records: &[HistoryRecord], limit: usize) {
    println!("{}", style("📜 Download History").cyan().bold());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    if records.is_empty() {
        println!("Nothing downloaded yet");
        return;
    }

    for record in records.iter().rev().take(limit) {
        let when = record
            .finished_at
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M");
        let title = record.title.as_deref().unwrap_or(&record.url);
        let state = match record.state {
            JobState::Completed => record.state.label().green(),
            JobState::Cancelled => record.state.label().yellow(),
            _ => record.state.label().red(),
        };
        println!("{}  {:<10} {}", when.to_string().dimmed(), state, title);
        if let Some(path) = &record.output_path {
            let size = record.file_size.map(format_bytes).unwrap_or_default();
            println!("{:18}{} {}", "", path.display(), size.dimmed());
        } else if let Some(error) = &record.error {
            println!("{:18}{}", "", error.red());
        }
    }
}
