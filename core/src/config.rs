use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::retry::RetryPolicy;

pub const ENV_PREFIX: &str = "YTGRAB";
pub const DEFAULT_TEMPLATE: &str = "{title}.{ext}";

/// What `Engine::stop` does with jobs that are already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopPolicy {
    /// Let active jobs run to a terminal state.
    Drain,
    /// Signal cancellation to active jobs.
    #[default]
    ForceCancel,
}

/// Engine configuration, passed explicitly at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub output_dir: PathBuf,
    /// Scratch directory created inside the output directory for partial files.
    pub temp_dir_name: String,
    pub output_template: String,
    pub max_concurrent: usize,
    /// Aggregate download limit. `None` means unlimited.
    pub rate_limit_bytes_per_sec: Option<u64>,
    pub chunk_size: usize,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub network_timeout_secs: u64,
    pub progress_interval_ms: u64,
    pub progress_byte_step: u64,
    pub observer_capacity: usize,
    pub stop_policy: StopPolicy,
    /// `None` disables the history file.
    pub history_path: Option<PathBuf>,
    pub ytdlp_path: PathBuf,
    pub ffmpeg_path: PathBuf,
    pub proxy: Option<String>,
    pub cookies_file: Option<PathBuf>,
    pub geo_bypass: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            temp_dir_name: ".ytgrab-partial".to_string(),
            output_template: DEFAULT_TEMPLATE.to_string(),
            max_concurrent: 3,
            rate_limit_bytes_per_sec: None,
            chunk_size: 64 * 1024,
            max_attempts: 3,
            retry_base_delay_ms: 1000,
            network_timeout_secs: 30,
            progress_interval_ms: 250,
            progress_byte_step: 1024 * 1024,
            observer_capacity: 1024,
            stop_policy: StopPolicy::default(),
            history_path: default_history_path(),
            ytdlp_path: PathBuf::from("yt-dlp"),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            proxy: None,
            cookies_file: None,
            geo_bypass: false,
        }
    }
}

impl EngineConfig {
    /// Defaults, then the JSON file at `path` if it exists, then `YTGRAB_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Json)
                    .required(false),
            );
        }
        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;

        let config: EngineConfig = settings.try_deserialize()?;
        Ok(config.normalized())
    }

    /// Clamp values that would stall the engine.
    pub fn normalized(mut self) -> Self {
        self.max_concurrent = self.max_concurrent.max(1);
        self.max_attempts = self.max_attempts.max(1);
        self.chunk_size = self.chunk_size.max(1024);
        self.observer_capacity = self.observer_capacity.max(1);
        if self.rate_limit_bytes_per_sec == Some(0) {
            self.rate_limit_bytes_per_sec = None;
        }
        if self.output_template.trim().is_empty() {
            self.output_template = DEFAULT_TEMPLATE.to_string();
        }
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.retry_base_delay_ms))
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs.max(1))
    }

    /// A metadata lookup is several round trips.
    pub fn resolve_timeout(&self) -> Duration {
        self.network_timeout().saturating_mul(4)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn temp_dir(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(&self.temp_dir_name)
    }
}

pub fn default_output_dir() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| PathBuf::from("downloads"))
}

pub fn default_history_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("ytgrab").join("history.jsonl"))
}

/// Where the CLI keeps its settings file.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("ytgrab").join("config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.output_template, "{title}.{ext}");
        assert_eq!(config.stop_policy, StopPolicy::ForceCancel);
        assert!(config.rate_limit_bytes_per_sec.is_none());
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{ "max_concurrent": 5, "rate_limit_bytes_per_sec": 500000, "stop_policy": "drain", "history_path": null }}"#
        )
        .unwrap();

        let config = EngineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.rate_limit_bytes_per_sec, Some(500_000));
        assert_eq!(config.stop_policy, StopPolicy::Drain);
        assert!(config.history_path.is_none());
        assert_eq!(config.chunk_size, 64 * 1024);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(Some(&dir.path().join("absent.json"))).unwrap();
        assert_eq!(config.max_attempts, EngineConfig::default().max_attempts);
    }

    #[test]
    fn normalization_clamps_stalling_values() {
        let config = EngineConfig {
            max_concurrent: 0,
            max_attempts: 0,
            rate_limit_bytes_per_sec: Some(0),
            output_template: "  ".into(),
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.max_concurrent, 1);
        assert_eq!(config.max_attempts, 1);
        assert!(config.rate_limit_bytes_per_sec.is_none());
        assert_eq!(config.output_template, DEFAULT_TEMPLATE);
    }
}
