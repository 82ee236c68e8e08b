use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ytgrab")]
#[command(about = "Queue-driven YouTube downloader")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output directory (default: from configuration)
    #[arg(short, long, global = true)]
    pub output: Option<PathBuf>,

    /// Parallel downloads
    #[arg(short, long, global = true)]
    pub jobs: Option<usize>,

    /// Total bandwidth cap, e.g. 500K or 2M (bytes per second)
    #[arg(long, global = true)]
    pub limit_rate: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Download a single video
    Get(GetArgs),

    /// Download a playlist
    Playlist(PlaylistArgs),

    /// Download every URL listed in a file, one per line
    Batch(BatchArgs),

    /// Get video or playlist information
    Info(InfoArgs),

    /// List available qualities
    Quality(QualityArgs),

    /// Past downloads
    History(HistoryArgs),

    /// Download configuration
    Config(ConfigArgs),
}

/// Options shared by every download command.
#[derive(Args, Clone)]
pub struct DownloadArgs {
    /// What to keep: video (video+audio), audio, video-only
    #[arg(short = 't', long = "type", default_value = "video")]
    pub download_type: String,

    /// Quality preset: best, 1080p, 720p, 480p, 360p, smallest
    #[arg(short, long, default_value = "best")]
    pub quality: String,

    /// Exact backend format id; overrides --quality
    #[arg(short = 'f', long)]
    pub format_id: Option<String>,

    /// Keep only from this point (SS, MM:SS or HH:MM:SS)
    #[arg(long, requires = "trim_end")]
    pub trim_start: Option<String>,

    /// Keep only up to this point (SS, MM:SS or HH:MM:SS)
    #[arg(long, requires = "trim_start")]
    pub trim_end: Option<String>,

    /// Audio codec for --type audio (mp3, m4a, aac, opus, flac, wav)
    #[arg(short, long)]
    pub audio_codec: Option<String>,

    /// Output name template, e.g. "{uploader}/{index} - {title}.{ext}"
    #[arg(long)]
    pub template: Option<String>,
}

#[derive(Args)]
pub struct GetArgs {
    /// Video URL
    pub url: String,

    #[command(flatten)]
    pub download: DownloadArgs,
}

#[derive(Args)]
pub struct PlaylistArgs {
    /// Playlist URL
    pub url: String,

    #[command(flatten)]
    pub download: DownloadArgs,

    /// Start from video number N
    #[arg(long)]
    pub start: Option<usize>,

    /// Download only N videos
    #[arg(short, long)]
    pub limit: Option<usize>,
}

#[derive(Args)]
pub struct BatchArgs {
    /// File with one URL per line, or - for stdin
    pub file: PathBuf,

    #[command(flatten)]
    pub download: DownloadArgs,
}

#[derive(Args)]
pub struct InfoArgs {
    /// Video or playlist URL
    pub url: String,

    /// Output format (json, table)
    #[arg(long, default_value = "table")]
    pub format: String,
}

#[derive(Args)]
pub struct QualityArgs {
    /// Video URL
    pub url: String,

    /// Show only audio qualities
    #[arg(long)]
    pub audio_only: bool,

    /// Show only video qualities
    #[arg(long)]
    pub video_only: bool,
}

#[derive(Args)]
pub struct HistoryArgs {
    #[command(subcommand)]
    pub action: HistoryAction,
}

#[derive(Subcommand)]
pub enum HistoryAction {
    /// List past downloads, newest first
    List {
        /// Show at most N entries
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Forget every past download
    Clear {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Write the history to a file (.csv for CSV, JSON lines otherwise)
    Export {
        /// Destination file
        path: PathBuf,
    },
}

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Set configuration value
    Set {
        /// Configuration key
        key: String,
        /// Configuration value
        value: String,
    },

    /// Reset configuration to defaults
    Reset,
}
