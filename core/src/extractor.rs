use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::BackendError;

/// Media item information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VideoInfo {
    pub id: String,
    pub title: String,
    /// Seconds. Live streams and some sites do not report one.
    pub duration: Option<f64>,
    pub uploader: Option<String>,
    pub upload_date: Option<String>,
    pub view_count: Option<u64>,
    pub webpage_url: Option<String>,
    pub formats: Vec<FormatInfo>,
    pub thumbnails: Vec<Thumbnail>,
}

/// Video/Audio format information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormatInfo {
    pub format_id: String,
    pub ext: String,
    pub format_note: Option<String>,
    pub acodec: Option<String>,
    pub vcodec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f32>,
    /// Audio bitrate in kbit/s
    pub abr: Option<f32>,
    /// Video bitrate in kbit/s
    pub vbr: Option<f32>,
    pub filesize: Option<u64>,
}

impl FormatInfo {
    pub fn has_video(&self) -> bool {
        self.vcodec.as_deref().is_some_and(|c| c != "none")
    }

    pub fn has_audio(&self) -> bool {
        self.acodec.as_deref().is_some_and(|c| c != "none")
    }

    pub fn is_audio_only(&self) -> bool {
        self.has_audio() && !self.has_video()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thumbnail {
    pub url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Playlist information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaylistInfo {
    pub id: String,
    pub title: String,
    pub uploader: Option<String>,
    /// Members in listing order.
    pub entries: Vec<PlaylistEntry>,
}

/// Light metadata of one playlist member. A listing may contain entries that
/// cannot be downloaded (private or removed videos without a URL).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaylistEntry {
    pub id: Option<String>,
    pub title: Option<String>,
    pub url: Option<String>,
    pub duration: Option<f64>,
    pub uploader: Option<String>,
    /// Why the listing says this entry is unusable, if it does.
    pub unavailable: Option<String>,
}

impl PlaylistEntry {
    /// URL the member can be downloaded from, or the reason it cannot.
    pub fn download_url(&self) -> Result<String, String> {
        if let Some(reason) = &self.unavailable {
            return Err(reason.clone());
        }
        match (&self.url, &self.id) {
            (Some(url), _) if is_http_url(url) => Ok(url.clone()),
            (_, Some(id)) if !id.is_empty() => Ok(format!("https://www.youtube.com/watch?v={id}")),
            (Some(url), _) => Err(format!("unusable member url: {url}")),
            (None, _) => Err("playlist member has no url".to_string()),
        }
    }
}

/// Result of a metadata lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Metadata {
    Video(VideoInfo),
    Playlist(PlaylistInfo),
}

impl Metadata {
    pub fn is_playlist(&self) -> bool {
        matches!(self, Metadata::Playlist(_))
    }

    pub fn title(&self) -> &str {
        match self {
            Metadata::Video(info) => &info.title,
            Metadata::Playlist(info) => &info.title,
        }
    }
}

/// What to stream and from where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub url: String,
    /// Backend format selector.
    pub format: String,
    /// Byte offset to continue from. Only non-zero when the backend supports resume.
    pub offset: u64,
}

/// A media stream being pulled chunk by chunk.
#[async_trait]
pub trait MediaStream: Send {
    /// Size of the whole item in bytes, including any skipped offset, when
    /// the backend knows it up front.
    fn total_bytes(&self) -> Option<u64>;

    /// Up to `max` bytes, or `None` at the end of the stream.
    async fn next_chunk(&mut self, max: usize) -> Result<Option<Bytes>, BackendError>;

    /// Confirms the stream ended cleanly. A backend that only learns about a
    /// failure when its process exits reports it here.
    async fn finish(self: Box<Self>) -> Result<(), BackendError>;
}

/// Source of metadata and media bytes.
#[async_trait]
pub trait ExtractionBackend: Send + Sync {
    async fn resolve_metadata(&self, url: &str) -> Result<Metadata, BackendError>;

    async fn open_stream(&self, request: StreamRequest) -> Result<Box<dyn MediaStream>, BackendError>;

    /// Whether `StreamRequest::offset` is honoured.
    fn supports_resume(&self) -> bool {
        false
    }
}

pub fn is_http_url(url: &str) -> bool {
    Url::parse(url)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
        .unwrap_or(false)
}

/// Playlist URLs carry a `list` parameter or a `/playlist` path.
pub fn looks_like_playlist(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let has_list = parsed.query_pairs().any(|(key, _)| key == "list");
    let has_video = parsed.query_pairs().any(|(key, _)| key == "v");
    parsed.path().starts_with("/playlist") || (has_list && !has_video)
}

/// Extract video ID from YouTube URL
pub fn extract_video_id(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    if host.ends_with("youtu.be") {
        return parsed
            .path_segments()?
            .next()
            .filter(|id| !id.is_empty())
            .map(str::to_string);
    }
    if let Some((_, id)) = parsed.query_pairs().find(|(key, _)| key == "v") {
        return Some(id.into_owned());
    }
    let mut segments = parsed.path_segments()?;
    match (segments.next(), segments.next()) {
        (Some("shorts" | "embed" | "live"), Some(id)) if !id.is_empty() => Some(id.to_string()),
        _ => None,
    }
}
