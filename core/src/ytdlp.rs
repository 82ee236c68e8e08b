use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::BackendError;
use crate::extractor::{
    ExtractionBackend, FormatInfo, MediaStream, Metadata, PlaylistEntry, PlaylistInfo,
    StreamRequest, Thumbnail, VideoInfo,
};

/// Titles yt-dlp gives listing entries that cannot be downloaded.
const UNAVAILABLE_TITLES: &[&str] = &["[Private video]", "[Deleted video]", "[Unavailable video]"];

/// Extraction backend driving the `yt-dlp` executable.
#[derive(Debug, Clone)]
pub struct YtDlpBackend {
    ytdlp_path: PathBuf,
    socket_timeout: Duration,
    proxy: Option<String>,
    cookies_file: Option<PathBuf>,
    geo_bypass: bool,
}

impl YtDlpBackend {
    pub fn new(ytdlp_path: impl Into<PathBuf>) -> Self {
        Self {
            ytdlp_path: ytdlp_path.into(),
            socket_timeout: Duration::from_secs(30),
            proxy: None,
            cookies_file: None,
            geo_bypass: false,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            ytdlp_path: config.ytdlp_path.clone(),
            socket_timeout: config.network_timeout(),
            proxy: config.proxy.clone().filter(|p| !p.trim().is_empty()),
            cookies_file: config.cookies_file.clone(),
            geo_bypass: config.geo_bypass,
        }
    }

    /// Check if yt-dlp is available
    pub async fn check_available(&self) -> bool {
        Command::new(&self.ytdlp_path)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    fn network_args(&self) -> Vec<String> {
        let mut args = vec![
            "--no-warnings".to_string(),
            "--socket-timeout".to_string(),
            self.socket_timeout.as_secs().to_string(),
        ];
        if let Some(proxy) = &self.proxy {
            args.extend(["--proxy".to_string(), proxy.clone()]);
        }
        if self.geo_bypass {
            args.push("--geo-bypass".to_string());
        }
        if let Some(cookies) = self.cookies_file.as_ref().filter(|p| p.exists()) {
            args.extend(["--cookies".to_string(), cookies.to_string_lossy().into_owned()]);
        }
        args
    }

    pub fn metadata_args(&self, url: &str) -> Vec<String> {
        let mut args = vec!["--dump-single-json".to_string(), "--flat-playlist".to_string()];
        args.extend(self.network_args());
        args.push("--".to_string());
        args.push(url.to_string());
        args
    }

    pub fn stream_args(&self, request: &StreamRequest) -> Vec<String> {
        let mut args = vec![
            "--quiet".to_string(),
            "--no-playlist".to_string(),
            "--no-part".to_string(),
            "-f".to_string(),
            request.format.clone(),
            "--merge-output-format".to_string(),
            "mkv".to_string(),
            // retries are the engine's job
            "--retries".to_string(),
            "0".to_string(),
            "-o".to_string(),
            "-".to_string(),
        ];
        args.extend(self.network_args());
        args.push("--".to_string());
        args.push(request.url.clone());
        args
    }

    fn command(&self, args: &[String]) -> Command {
        let mut command = Command::new(&self.ytdlp_path);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn spawn_error(&self, err: std::io::Error) -> BackendError {
        match err.kind() {
            std::io::ErrorKind::NotFound => {
                BackendError::ToolMissing(self.ytdlp_path.display().to_string())
            }
            _ => BackendError::Io(err),
        }
    }
}

#[async_trait]
impl ExtractionBackend for YtDlpBackend {
    async fn resolve_metadata(&self, url: &str) -> Result<Metadata, BackendError> {
        info!("Resolving metadata for: {}", url);
        let args = self.metadata_args(url);
        debug!("yt-dlp {}", args.join(" "));

        // a listing takes several round trips
        let limit = self.socket_timeout.saturating_mul(4);
        let output = tokio::time::timeout(limit, self.command(&args).output())
            .await
            .map_err(|_| BackendError::Timeout(limit.as_secs()))?
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("yt-dlp metadata lookup failed for {}: {}", url, stderr.trim());
            return Err(classify_stderr(&stderr));
        }

        let json: Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| BackendError::Unsupported(format!("unreadable yt-dlp output: {e}")))?;
        Ok(parse_metadata(&json))
    }

    async fn open_stream(&self, request: StreamRequest) -> Result<Box<dyn MediaStream>, BackendError> {
        if request.offset > 0 {
            return Err(BackendError::Unsupported("yt-dlp streams cannot start at an offset".into()));
        }
        let args = self.stream_args(&request);
        debug!("yt-dlp {}", args.join(" "));

        let mut child = self.command(&args).spawn().map_err(|e| self.spawn_error(e))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Network("yt-dlp stdout unavailable".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| BackendError::Network("yt-dlp stderr unavailable".into()))?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        Ok(Box::new(YtDlpStream {
            child,
            stdout: BufReader::new(stdout),
            stderr_task,
        }))
    }
}

/// Media bytes read from yt-dlp's stdout.
struct YtDlpStream {
    child: Child,
    stdout: BufReader<ChildStdout>,
    stderr_task: JoinHandle<String>,
}

#[async_trait]
impl MediaStream for YtDlpStream {
    fn total_bytes(&self) -> Option<u64> {
        None
    }

    async fn next_chunk(&mut self, max: usize) -> Result<Option<Bytes>, BackendError> {
        let mut buf = vec![0u8; max.max(1)];
        let read = self.stdout.read(&mut buf).await?;
        if read == 0 {
            return Ok(None);
        }
        buf.truncate(read);
        Ok(Some(Bytes::from(buf)))
    }

    async fn finish(mut self: Box<Self>) -> Result<(), BackendError> {
        let status = self.child.wait().await?;
        let stderr = self.stderr_task.await.unwrap_or_default();
        if status.success() {
            Ok(())
        } else {
            warn!("yt-dlp exited with {status}: {}", stderr.trim());
            Err(classify_stderr(&stderr))
        }
    }
}

/// Map yt-dlp's stderr to the backend error taxonomy.
pub fn classify_stderr(stderr: &str) -> BackendError {
    let message = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("yt-dlp failed")
        .trim()
        .trim_start_matches("ERROR:")
        .trim()
        .to_string();
    let lower = stderr.to_lowercase();

    if lower.contains("http error 429") || lower.contains("too many requests") {
        BackendError::RateLimited(message)
    } else if lower.contains("requested format is not available") {
        BackendError::FormatUnavailable(message)
    } else if lower.contains("unsupported url") {
        BackendError::Unsupported(message)
    } else if lower.contains("video unavailable")
        || lower.contains("private video")
        || lower.contains("has been removed")
        || lower.contains("http error 404")
        || lower.contains("does not exist")
    {
        BackendError::NotFound(message)
    } else if lower.contains("no space left") {
        BackendError::Io(std::io::Error::new(std::io::ErrorKind::Other, message))
    } else if lower.contains("timed out") || lower.contains("timeout") {
        BackendError::Network(message)
    } else if lower.contains("unable to download")
        || lower.contains("connection")
        || lower.contains("temporary failure")
        || lower.contains("http error 5")
    {
        BackendError::Network(message)
    } else {
        BackendError::Unsupported(message)
    }
}

/// Build metadata from `--dump-single-json` output.
pub fn parse_metadata(json: &Value) -> Metadata {
    let is_playlist = json["_type"].as_str() == Some("playlist") || json["entries"].is_array();
    if is_playlist {
        Metadata::Playlist(parse_playlist(json))
    } else {
        Metadata::Video(parse_video(json))
    }
}

fn parse_video(json: &Value) -> VideoInfo {
    let formats = json["formats"]
        .as_array()
        .map(|formats| formats.iter().map(parse_format).collect())
        .unwrap_or_default();
    let thumbnails = json["thumbnails"]
        .as_array()
        .map(|thumbs| {
            thumbs
                .iter()
                .filter_map(|t| {
                    Some(Thumbnail {
                        url: t["url"].as_str()?.to_string(),
                        width: t["width"].as_u64().map(|w| w as u32),
                        height: t["height"].as_u64().map(|h| h as u32),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    VideoInfo {
        id: string(json, "id").unwrap_or_default(),
        title: string(json, "title").unwrap_or_else(|| "Unknown".to_string()),
        duration: json["duration"].as_f64(),
        uploader: string(json, "uploader").or_else(|| string(json, "channel")),
        upload_date: string(json, "upload_date"),
        view_count: json["view_count"].as_u64(),
        webpage_url: string(json, "webpage_url"),
        formats,
        thumbnails,
    }
}

fn parse_format(f: &Value) -> FormatInfo {
    FormatInfo {
        format_id: string(f, "format_id").unwrap_or_default(),
        ext: string(f, "ext").unwrap_or_default(),
        format_note: string(f, "format_note"),
        acodec: string(f, "acodec"),
        vcodec: string(f, "vcodec"),
        width: f["width"].as_u64().map(|w| w as u32),
        height: f["height"].as_u64().map(|h| h as u32),
        fps: f["fps"].as_f64().map(|fps| fps as f32),
        abr: f["abr"].as_f64().map(|a| a as f32),
        vbr: f["vbr"].as_f64().map(|v| v as f32),
        filesize: f["filesize"].as_u64().or_else(|| f["filesize_approx"].as_u64()),
    }
}

fn parse_playlist(json: &Value) -> PlaylistInfo {
    let entries = json["entries"]
        .as_array()
        .map(|entries| entries.iter().map(parse_entry).collect())
        .unwrap_or_default();

    PlaylistInfo {
        id: string(json, "id").unwrap_or_default(),
        title: string(json, "title").unwrap_or_else(|| "Unknown playlist".to_string()),
        uploader: string(json, "uploader").or_else(|| string(json, "channel")),
        entries,
    }
}

fn parse_entry(e: &Value) -> PlaylistEntry {
    let title = string(e, "title");
    let unavailable = if e.is_null() {
        Some("entry missing from listing".to_string())
    } else {
        title
            .as_deref()
            .filter(|t| UNAVAILABLE_TITLES.contains(t))
            .map(str::to_string)
    };

    PlaylistEntry {
        id: string(e, "id"),
        title,
        url: string(e, "url").or_else(|| string(e, "webpage_url")),
        duration: e["duration"].as_f64(),
        uploader: string(e, "uploader").or_else(|| string(e, "channel")),
        unavailable,
    }
}

fn string(json: &Value, key: &str) -> Option<String> {
    json[key].as_str().filter(|s| !s.is_empty()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn stderr_classification() {
        assert!(matches!(
            classify_stderr("ERROR: [youtube] abc: HTTP Error 429: Too Many Requests"),
            BackendError::RateLimited(_)
        ));
        assert!(matches!(
            classify_stderr("ERROR: [youtube] abc: Video unavailable"),
            BackendError::NotFound(_)
        ));
        assert!(matches!(
            classify_stderr("ERROR: Unsupported URL: https://example.com"),
            BackendError::Unsupported(_)
        ));
        assert!(matches!(
            classify_stderr("ERROR: [youtube] abc: Requested format is not available"),
            BackendError::FormatUnavailable(_)
        ));
        assert_eq!(
            classify_stderr("ERROR: Read timed out.").kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            classify_stderr("ERROR: unable to write data: [Errno 28] No space left on device").kind(),
            ErrorKind::ResourceExhaustion
        );
    }

    #[test]
    fn classified_message_drops_prefix() {
        let err = classify_stderr("WARNING: x\nERROR: [youtube] abc: Video unavailable\n");
        assert_eq!(err.to_string(), "item not found: [youtube] abc: Video unavailable");
    }

    #[test]
    fn parses_video_json() {
        let json = json!({
            "id": "abc",
            "title": "Song",
            "duration": 212.5,
            "channel": "Band",
            "formats": [
                {"format_id": "140", "ext": "m4a", "acodec": "mp4a.40.2", "vcodec": "none", "abr": 129.5, "filesize": 3_400_000},
                {"format_id": "137", "ext": "mp4", "acodec": "none", "vcodec": "avc1", "height": 1080, "filesize_approx": 50_000_000}
            ]
        });
        let Metadata::Video(info) = parse_metadata(&json) else {
            panic!("expected a video");
        };
        assert_eq!(info.title, "Song");
        assert_eq!(info.uploader.as_deref(), Some("Band"));
        assert_eq!(info.duration, Some(212.5));
        assert_eq!(info.formats.len(), 2);
        assert!(info.formats[0].is_audio_only());
        assert_eq!(info.formats[1].filesize, Some(50_000_000));
    }

    #[test]
    fn parses_flat_playlist_json() {
        let json = json!({
            "_type": "playlist",
            "id": "PL1",
            "title": "Mix",
            "entries": [
                {"id": "a", "title": "One", "url": "https://www.youtube.com/watch?v=a"},
                {"id": "b", "title": "[Private video]", "url": "https://www.youtube.com/watch?v=b"},
                null
            ]
        });
        let Metadata::Playlist(list) = parse_metadata(&json) else {
            panic!("expected a playlist");
        };
        assert_eq!(list.title, "Mix");
        assert_eq!(list.entries.len(), 3);
        assert!(list.entries[0].download_url().is_ok());
        assert!(list.entries[1].download_url().is_err());
        assert!(list.entries[2].download_url().is_err());
    }

    #[test]
    fn args_carry_network_settings() {
        let config = EngineConfig {
            proxy: Some("socks5://127.0.0.1:9050".into()),
            geo_bypass: true,
            network_timeout_secs: 12,
            ..Default::default()
        };
        let backend = YtDlpBackend::from_config(&config);
        let args = backend.stream_args(&StreamRequest {
            url: "https://a.example/v".into(),
            format: "bestaudio/best".into(),
            offset: 0,
        });
        let joined = args.join(" ");
        assert!(joined.contains("-f bestaudio/best"));
        assert!(joined.contains("-o -"));
        assert!(joined.contains("--socket-timeout 12"));
        assert!(joined.contains("--proxy socks5://127.0.0.1:9050"));
        assert!(joined.contains("--geo-bypass"));
        assert_eq!(args.last().map(String::as_str), Some("https://a.example/v"));
    }
}
