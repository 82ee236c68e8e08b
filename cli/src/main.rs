mod args;
mod config;
mod ui;

use anyhow::{bail, Context, Result};
use args::{Cli, Commands, DownloadArgs};
use clap::Parser;
use colored::*;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use ytgrab_core::*;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(cli.verbose);

    let config = engine_config(&cli);

    match cli.command {
        Commands::Get(args) => {
            let descriptor = descriptor(SourceDescriptor::video(args.url), &args.download)?;
            download(config?, descriptor).await?;
        }

        Commands::Playlist(args) => {
            let mut descriptor = descriptor(SourceDescriptor::playlist(args.url), &args.download)?;
            descriptor.options.playlist_range = PlaylistRange {
                start: args.start,
                limit: args.limit,
            };
            download(config?, descriptor).await?;
        }

        Commands::Batch(args) => {
            let urls = read_url_list(&args.file)?;
            if urls.is_empty() {
                bail!("{} lists no URLs", args.file.display());
            }
            println!("📋 {} URLs queued from {}", urls.len(), args.file.display());
            let descriptor = descriptor(SourceDescriptor::url_list(urls), &args.download)?;
            download(config?, descriptor).await?;
        }

        Commands::Info(args) => {
            let engine = build_engine(config?).await?;
            let metadata = engine.resolve_info(&args.url).await?;
            match args.format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&metadata)?),
                _ => ui::display_metadata(&metadata),
            }
        }

        Commands::Quality(args) => {
            let engine = build_engine(config?).await?;
            let qualities = engine.available_qualities(&args.url).await?;
            ui::display_quality_options(&qualities, args.audio_only, args.video_only);
        }

        Commands::History(args) => {
            handle_history(config?, args)?;
        }

        Commands::Config(args) => {
            handle_config(&args)?;
        }
    }

    Ok(())
}

/// Configuration file and environment, then command-line overrides.
fn engine_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = config::load_config()?;
    if let Some(output) = &cli.output {
        config.output_dir = output.clone();
    }
    if let Some(jobs) = cli.jobs {
        if jobs == 0 {
            bail!("--jobs must be at least 1");
        }
        config.max_concurrent = jobs;
    }
    if let Some(rate) = &cli.limit_rate {
        let bytes = parse_rate_limit(rate)
            .with_context(|| format!("invalid rate limit '{rate}', expected e.g. 500K or 2M"))?;
        config.rate_limit_bytes_per_sec = Some(bytes);
    }
    Ok(config)
}

fn descriptor(base: SourceDescriptor, args: &DownloadArgs) -> Result<SourceDescriptor> {
    let download_type: DownloadType = args.download_type.parse()?;
    let selection = match &args.format_id {
        Some(id) => FormatSelection::FormatId(id.clone()),
        None => FormatSelection::Preset(args.quality.parse()?),
    };

    let mut descriptor = base.with_type(download_type).with_selection(selection);
    if let (Some(start), Some(end)) = (&args.trim_start, &args.trim_end) {
        let start = parse_timestamp(start).with_context(|| format!("invalid trim start '{start}'"))?;
        let end = parse_timestamp(end).with_context(|| format!("invalid trim end '{end}'"))?;
        descriptor = descriptor.with_trim(start, end);
    }
    if let Some(codec) = &args.audio_codec {
        if download_type != DownloadType::AudioOnly {
            warn!("--audio-codec only applies to --type audio");
        }
        descriptor.options.audio_codec = Some(codec.parse()?);
    }
    descriptor.options.output_template = args.template.clone();
    Ok(descriptor)
}

fn read_url_list(file: &Path) -> Result<Vec<String>> {
    let text = if file.as_os_str() == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("failed to read URLs from stdin")?;
        text
    } else {
        std::fs::read_to_string(file).with_context(|| format!("failed to read {}", file.display()))?
    };

    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

async fn build_engine(config: EngineConfig) -> Result<Engine> {
    let backend = Arc::new(YtDlpBackend::from_config(&config));
    if !backend.check_available().await {
        bail!(
            "{} was not found; install yt-dlp or set ytdlp_path with `ytgrab config set`",
            config.ytdlp_path.display()
        );
    }
    let transcoder = Arc::new(FfmpegTranscoder::new(&config.ffmpeg_path));
    if !transcoder.check_available().await {
        warn!("ffmpeg was not found; trimming and audio extraction will fail");
    }
    Ok(Engine::new(config, backend, transcoder)?)
}

/// Run one descriptor to completion, rendering progress until every job
/// finished or Ctrl-C stopped the engine.
async fn download(config: EngineConfig, descriptor: SourceDescriptor) -> Result<()> {
    let output_dir = descriptor
        .options
        .output_dir
        .clone()
        .unwrap_or_else(|| config.output_dir.clone());
    let engine = build_engine(config).await?;

    let events = engine.subscribe();
    let view = tokio::spawn(ui::ProgressView::new().run(events));

    let batch = engine.submit(descriptor)?;
    engine.start()?;
    info!("Saving to {}", output_dir.display());

    let interrupted = tokio::select! {
        progress = engine.wait_for_batch(batch) => {
            progress?;
            false
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\n{}", "⏹️  Stopping...".yellow());
            true
        }
    };

    engine.stop().await;
    view.await.context("progress display crashed")?;

    let summary = engine
        .batch_progress(batch)
        .context("batch disappeared from the queue")?;
    print_summary(&engine, batch, &summary);

    if interrupted {
        bail!("interrupted");
    }
    if summary.failed_jobs > 0 {
        bail!("{} of {} downloads failed", summary.failed_jobs, summary.total_jobs);
    }
    if let Some(Batch {
        status: BatchStatus::Failed(err),
        ..
    }) = engine.batch(batch)
    {
        bail!("{}", err.message);
    }
    Ok(())
}

fn print_summary(engine: &Engine, batch: BatchId, summary: &BatchProgress) {
    println!();
    println!("📊 Download Summary:");
    println!("   ✅ Completed: {}", summary.completed_jobs.to_string().green());
    println!("   ❌ Failed: {}", summary.failed_jobs.to_string().red());
    if summary.cancelled_jobs > 0 {
        println!("   ⏹️  Cancelled: {}", summary.cancelled_jobs.to_string().yellow());
    }

    let Some(batch) = engine.batch(batch) else { return };
    for job in batch.job_ids.iter().filter_map(|id| engine.job(*id)) {
        match (&job.state, &job.output_path, &job.error) {
            (JobState::Completed, Some(path), _) => {
                println!("   🎉 {}", path.display().to_string().green());
            }
            (JobState::Failed, _, Some(err)) => {
                println!("   💥 {}: {}", job.display_name(), err.message.red());
            }
            _ => {}
        }
    }
}

fn handle_history(config: EngineConfig, args: args::HistoryArgs) -> Result<()> {
    let Some(path) = config.history_path else {
        bail!("history is disabled (history_path is null)");
    };
    let history = HistoryStore::open(path)?;

    match args.action {
        args::HistoryAction::List { limit } => {
            ui::display_history(&history.records(), limit);
        }
        args::HistoryAction::Clear { yes } => {
            let confirmed = yes
                || dialoguer::Confirm::new()
                    .with_prompt(format!("Forget all {} past downloads?", history.len()))
                    .default(false)
                    .interact()?;
            if confirmed {
                history.clear()?;
                println!("🧹 History cleared");
            }
        }
        args::HistoryAction::Export { path } => {
            let count = history.export(&path)?;
            println!("💾 Exported {} entries to {}", count, path.display());
        }
    }
    Ok(())
}

fn handle_config(args: &args::ConfigArgs) -> Result<()> {
    match &args.action {
        args::ConfigAction::Show => {
            config::show_config()?;
        }
        args::ConfigAction::Set { key, value } => {
            config::set_config(key, value)?;
        }
        args::ConfigAction::Reset => {
            config::reset_config()?;
        }
    }
    Ok(())
}

fn setup_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .init();
}
