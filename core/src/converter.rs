use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{EngineError, TranscodeError};
use crate::job::TrimWindow;
use crate::utils::get_optimal_thread_count;

/// Audio codec for audio-only extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AudioCodec {
    #[default]
    Mp3,
    M4a,
    Aac,
    Opus,
    Flac,
    Wav,
}

impl AudioCodec {
    pub fn extension(self) -> &'static str {
        match self {
            AudioCodec::Mp3 => "mp3",
            AudioCodec::M4a => "m4a",
            AudioCodec::Aac => "aac",
            AudioCodec::Opus => "opus",
            AudioCodec::Flac => "flac",
            AudioCodec::Wav => "wav",
        }
    }

    fn ffmpeg_args(self) -> &'static [&'static str] {
        match self {
            AudioCodec::Mp3 => &["-c:a", "libmp3lame", "-b:a", "192k"],
            AudioCodec::M4a | AudioCodec::Aac => &["-c:a", "aac", "-b:a", "256k", "-ar", "48000"],
            AudioCodec::Opus => &["-c:a", "libopus", "-b:a", "160k"],
            AudioCodec::Flac => &["-c:a", "flac"],
            AudioCodec::Wav => &["-c:a", "pcm_s16le"],
        }
    }
}

impl fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for AudioCodec {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mp3" => Ok(AudioCodec::Mp3),
            "m4a" => Ok(AudioCodec::M4a),
            "aac" => Ok(AudioCodec::Aac),
            "opus" => Ok(AudioCodec::Opus),
            "flac" => Ok(AudioCodec::Flac),
            "wav" => Ok(AudioCodec::Wav),
            other => Err(EngineError::InvalidDescriptor(format!("unknown audio codec: {other}"))),
        }
    }
}

/// What the transcoder should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetCodec {
    /// Keep the container and video stream, re-encode audio to AAC.
    Keep,
    /// Drop video and encode audio.
    Audio(AudioCodec),
}

impl TargetCodec {
    /// Extension of the processed file given the raw download's extension.
    pub fn extension<'a>(&self, raw_ext: &'a str) -> &'a str {
        match self {
            TargetCodec::Keep => raw_ext,
            TargetCodec::Audio(codec) => codec.extension(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub trim: Option<TrimWindow>,
    pub target: TargetCodec,
    /// Input duration in seconds, used to turn the tool's position into a percentage.
    pub duration: Option<f64>,
}

impl TranscodeRequest {
    /// Length of media the output will contain.
    pub fn expected_duration(&self) -> Option<f64> {
        match self.trim {
            Some(trim) => Some(trim.length()),
            None => self.duration,
        }
    }
}

/// Trims and re-encodes downloaded media.
#[async_trait]
pub trait MediaTranscoder: Send + Sync {
    /// `progress` receives 0.0 to 100.0. Implementations stop and remove
    /// partial output when `cancel` fires.
    async fn transcode(
        &self,
        request: TranscodeRequest,
        progress: &(dyn Fn(f64) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<(), TranscodeError>;
}

/// ffmpeg subprocess transcoder
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg_path: PathBuf,
    threads: usize,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg_path: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            threads: get_optimal_thread_count(),
        }
    }

    /// Check if ffmpeg is available
    pub async fn check_available(&self) -> bool {
        Command::new(&self.ffmpeg_path)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    pub fn build_args(&self, request: &TranscodeRequest) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-nostdin", "-y", "-loglevel", "error"]
            .into_iter()
            .map(String::from)
            .collect();
        args.extend(["-progress".into(), "pipe:1".into(), "-nostats".into()]);

        if let Some(trim) = request.trim {
            args.extend(["-ss".into(), format_seconds(trim.start)]);
            args.extend(["-to".into(), format_seconds(trim.end)]);
        }
        args.push("-i".into());
        args.push(request.input.to_string_lossy().into_owned());

        match request.target {
            TargetCodec::Keep => {
                args.extend(
                    ["-map", "0", "-c:v", "copy", "-c:a", "aac", "-b:a", "192k", "-ar", "48000"]
                        .into_iter()
                        .map(String::from),
                );
            }
            TargetCodec::Audio(codec) => {
                args.push("-vn".into());
                args.extend(codec.ffmpeg_args().iter().map(|s| s.to_string()));
            }
        }

        args.extend(["-threads".into(), self.threads.to_string()]);
        args.push(request.output.to_string_lossy().into_owned());
        args
    }
}

#[async_trait]
impl MediaTranscoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        request: TranscodeRequest,
        progress: &(dyn Fn(f64) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<(), TranscodeError> {
        let args = self.build_args(&request);
        debug!("ffmpeg {}", args.join(" "));

        let mut child = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    TranscodeError::ToolMissing(self.ffmpeg_path.display().to_string())
                }
                _ => TranscodeError::Io(e),
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TranscodeError::Failed("ffmpeg stdout unavailable".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| TranscodeError::Failed("ffmpeg stderr unavailable".into()))?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let expected = request.expected_duration();
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    let _ = tokio::fs::remove_file(&request.output).await;
                    return Err(TranscodeError::Cancelled);
                }
                line = lines.next_line() => match line? {
                    Some(line) => {
                        if let Some(percent) = parse_progress_line(&line, expected) {
                            progress(percent);
                        }
                    }
                    None => break,
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                let _ = tokio::fs::remove_file(&request.output).await;
                return Err(TranscodeError::Cancelled);
            }
            status = child.wait() => status?,
        };
        let stderr = stderr_task.await.unwrap_or_default();

        if status.success() {
            progress(100.0);
            info!("Transcoded {:?} -> {:?}", request.input, request.output);
            Ok(())
        } else {
            warn!("ffmpeg exited with {status}: {}", stderr.trim());
            let _ = tokio::fs::remove_file(&request.output).await;
            Err(classify_ffmpeg_failure(&stderr))
        }
    }
}

/// Percentage from one `-progress` line, if it carries a position.
pub fn parse_progress_line(line: &str, expected_secs: Option<f64>) -> Option<f64> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        // both keys are in microseconds despite the name of the second
        "out_time_us" | "out_time_ms" => {
            let expected = expected_secs.filter(|d| *d > 0.0)?;
            let micros: f64 = value.trim().parse().ok()?;
            Some((micros / 1_000_000.0 / expected * 100.0).clamp(0.0, 100.0))
        }
        "progress" if value.trim() == "end" => Some(100.0),
        _ => None,
    }
}

/// Map ffmpeg's stderr to the transcoder error taxonomy.
pub fn classify_ffmpeg_failure(stderr: &str) -> TranscodeError {
    let lower = stderr.to_lowercase();
    let message = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("ffmpeg failed")
        .trim()
        .to_string();

    if lower.contains("unknown encoder") || lower.contains("encoder not found") {
        TranscodeError::UnsupportedCodec(message)
    } else if lower.contains("invalid data found when processing input")
        || lower.contains("moov atom not found")
        || lower.contains("could not find codec parameters")
        || lower.contains("end of file")
    {
        TranscodeError::InvalidInput(message)
    } else if lower.contains("no space left on device") {
        TranscodeError::Io(std::io::Error::new(std::io::ErrorKind::Other, message))
    } else {
        TranscodeError::Failed(message)
    }
}

fn format_seconds(secs: f64) -> String {
    format!("{secs:.3}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(trim: Option<TrimWindow>, target: TargetCodec) -> TranscodeRequest {
        TranscodeRequest {
            input: PathBuf::from("/tmp/raw.mkv"),
            output: PathBuf::from("/tmp/out.mp3"),
            trim,
            target,
            duration: Some(200.0),
        }
    }

    #[test]
    fn test_trim_arguments_precede_input() {
        let transcoder = FfmpegTranscoder::new("ffmpeg");
        let args = transcoder.build_args(&request(
            Some(TrimWindow::new(10.0, 25.5)),
            TargetCodec::Audio(AudioCodec::Mp3),
        ));

        let ss = args.iter().position(|a| a == "-ss").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(ss < input);
        assert_eq!(args[ss + 1], "10.000");
        assert_eq!(args[ss + 3], "25.500");
        assert!(args.contains(&"-vn".to_string()));
        assert!(args.contains(&"libmp3lame".to_string()));
        assert_eq!(args.last().unwrap(), "/tmp/out.mp3");
    }

    #[test]
    fn test_keep_target_copies_video() {
        let transcoder = FfmpegTranscoder::new("ffmpeg");
        let args = transcoder.build_args(&request(Some(TrimWindow::new(0.0, 5.0)), TargetCodec::Keep));
        let cv = args.iter().position(|a| a == "-c:v").unwrap();
        assert_eq!(args[cv + 1], "copy");
        assert!(!args.contains(&"-vn".to_string()));
    }

    #[test]
    fn test_progress_lines() {
        assert_eq!(parse_progress_line("out_time_us=5000000", Some(10.0)), Some(50.0));
        assert_eq!(parse_progress_line("out_time_ms=20000000", Some(10.0)), Some(100.0));
        assert_eq!(parse_progress_line("out_time_us=5000000", None), None);
        assert_eq!(parse_progress_line("progress=end", None), Some(100.0));
        assert_eq!(parse_progress_line("progress=continue", Some(1.0)), None);
        assert_eq!(parse_progress_line("bitrate=128k", Some(1.0)), None);
    }

    #[test]
    fn test_expected_duration_prefers_trim() {
        let trimmed = request(Some(TrimWindow::new(10.0, 40.0)), TargetCodec::Keep);
        assert_eq!(trimmed.expected_duration(), Some(30.0));
        assert_eq!(request(None, TargetCodec::Keep).expected_duration(), Some(200.0));
    }

    #[test]
    fn test_failure_classification() {
        assert!(classify_ffmpeg_failure("raw.mkv: Invalid data found when processing input")
            .is_corrupted_input());
        assert!(matches!(
            classify_ffmpeg_failure("Unknown encoder 'libfdk_aac'"),
            TranscodeError::UnsupportedCodec(_)
        ));
        assert!(matches!(
            classify_ffmpeg_failure("Conversion failed!"),
            TranscodeError::Failed(_)
        ));
    }

    #[test]
    fn test_codec_parsing_and_extension() {
        assert_eq!("FLAC".parse::<AudioCodec>().unwrap(), AudioCodec::Flac);
        assert!("ape".parse::<AudioCodec>().is_err());
        assert_eq!(TargetCodec::Audio(AudioCodec::Opus).extension("webm"), "opus");
        assert_eq!(TargetCodec::Keep.extension("mkv"), "mkv");
    }
}
