use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::batch::BatchKind;
use crate::config::EngineConfig;
use crate::converter::AudioCodec;
use crate::error::{EngineError, Result};
use crate::extractor::{is_http_url, looks_like_playlist};
use crate::job::{DownloadType, JobRequest, TrimWindow};
use crate::quality::FormatSelection;

/// What the shell asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Source {
    Video(String),
    Playlist(String),
    UrlList(Vec<String>),
}

impl Source {
    /// Video or playlist, from the shape of the URL.
    pub fn detect(url: impl Into<String>) -> Self {
        let url = url.into();
        if looks_like_playlist(&url) {
            Source::Playlist(url)
        } else {
            Source::Video(url)
        }
    }

    pub fn batch_kind(&self) -> BatchKind {
        match self {
            Source::Video(_) => BatchKind::Single,
            Source::Playlist(_) => BatchKind::Playlist,
            Source::UrlList(_) => BatchKind::UrlList,
        }
    }

    pub fn label(&self) -> String {
        match self {
            Source::Video(url) | Source::Playlist(url) => url.clone(),
            Source::UrlList(urls) => format!("{} urls", urls.len()),
        }
    }
}

/// Subset of a playlist listing to enqueue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistRange {
    /// 1-based index of the first member.
    pub start: Option<usize>,
    pub limit: Option<usize>,
}

impl PlaylistRange {
    /// Listing positions (0-based) this range selects out of `len` members.
    pub fn positions(&self, len: usize) -> std::ops::Range<usize> {
        let first = self.start.unwrap_or(1).saturating_sub(1).min(len);
        let last = match self.limit {
            Some(limit) => first.saturating_add(limit).min(len),
            None => len,
        };
        first..last
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadOptions {
    pub download_type: DownloadType,
    pub selection: FormatSelection,
    pub trim: Option<TrimWindow>,
    /// Codec for audio-only downloads. Defaults to mp3.
    pub audio_codec: Option<AudioCodec>,
    pub output_template: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub playlist_range: PlaylistRange,
}

/// A submission: where the media comes from and how to fetch it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub source: Source,
    pub options: DownloadOptions,
}

impl SourceDescriptor {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            options: DownloadOptions::default(),
        }
    }

    pub fn video(url: impl Into<String>) -> Self {
        Self::new(Source::Video(url.into()))
    }

    pub fn playlist(url: impl Into<String>) -> Self {
        Self::new(Source::Playlist(url.into()))
    }

    pub fn url_list<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Source::UrlList(urls.into_iter().map(Into::into).collect()))
    }

    pub fn with_options(mut self, options: DownloadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_type(mut self, download_type: DownloadType) -> Self {
        self.options.download_type = download_type;
        self
    }

    pub fn with_selection(mut self, selection: FormatSelection) -> Self {
        self.options.selection = selection;
        self
    }

    pub fn with_trim(mut self, start: f64, end: f64) -> Self {
        self.options.trim = Some(TrimWindow::new(start, end));
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.output_dir = Some(dir.into());
        self
    }

    /// Everything that can be checked without asking the backend.
    pub fn validate(&self) -> Result<()> {
        let urls: Vec<&String> = match &self.source {
            Source::Video(url) | Source::Playlist(url) => vec![url],
            Source::UrlList(urls) => {
                if urls.iter().all(|u| u.trim().is_empty()) {
                    return Err(EngineError::InvalidDescriptor("url list is empty".into()));
                }
                urls.iter().filter(|u| !u.trim().is_empty()).collect()
            }
        };

        for url in urls {
            let url = url.trim();
            if url.is_empty() {
                return Err(EngineError::InvalidDescriptor("url is empty".into()));
            }
            if !is_http_url(url) {
                return Err(EngineError::InvalidDescriptor(format!("not an http(s) url: {url}")));
            }
        }

        if let Some(trim) = &self.options.trim {
            trim.validate_shape()?;
        }

        if let crate::quality::FormatSelection::FormatId(id) = &self.options.selection {
            if id.trim().is_empty() {
                return Err(EngineError::InvalidDescriptor("format id is empty".into()));
            }
        }

        if self.options.playlist_range.limit == Some(0) {
            return Err(EngineError::InvalidDescriptor("playlist limit must be at least 1".into()));
        }

        Ok(())
    }

    /// URLs to enqueue directly. Playlists expand later.
    pub fn direct_urls(&self) -> Vec<String> {
        match &self.source {
            Source::Video(url) => vec![url.trim().to_string()],
            Source::Playlist(_) => Vec::new(),
            Source::UrlList(urls) => urls
                .iter()
                .map(|u| u.trim())
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    /// Per-job settings with configuration defaults filled in.
    pub fn job_request(&self, config: &EngineConfig) -> JobRequest {
        JobRequest {
            download_type: self.options.download_type,
            selection: self.options.selection.clone(),
            trim: self.options.trim,
            audio_codec: self.options.audio_codec.unwrap_or_default(),
            output_dir: self
                .options
                .output_dir
                .clone()
                .unwrap_or_else(|| config.output_dir.clone()),
            output_template: self
                .options
                .output_template
                .clone()
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| config.output_template.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_malformed_urls() {
        assert!(SourceDescriptor::video("").validate().is_err());
        assert!(SourceDescriptor::video("   ").validate().is_err());
        assert!(SourceDescriptor::video("youtube.com/watch?v=x").validate().is_err());
        assert!(SourceDescriptor::url_list(Vec::<String>::new()).validate().is_err());
        assert!(SourceDescriptor::url_list(["https://a.example/1", "nope"]).validate().is_err());
        assert!(SourceDescriptor::video("https://a.example/1").validate().is_ok());
    }

    #[test]
    fn reversed_trim_is_rejected_up_front() {
        let err = SourceDescriptor::video("https://a.example/1")
            .with_trim(10.0, 5.0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTrimRange { start, end } if start == 10.0 && end == 5.0));
    }

    #[test]
    fn url_list_skips_blank_lines() {
        let descriptor = SourceDescriptor::url_list(["https://a.example/1", " ", "https://a.example/2 "]);
        assert!(descriptor.validate().is_ok());
        assert_eq!(
            descriptor.direct_urls(),
            vec!["https://a.example/1".to_string(), "https://a.example/2".to_string()]
        );
    }

    #[test]
    fn detect_picks_playlist_by_url_shape() {
        assert!(matches!(
            Source::detect("https://www.youtube.com/playlist?list=PL1"),
            Source::Playlist(_)
        ));
        assert!(matches!(
            Source::detect("https://www.youtube.com/watch?v=abc"),
            Source::Video(_)
        ));
    }

    #[test]
    fn playlist_range_selects_positions() {
        let all = PlaylistRange::default();
        assert_eq!(all.positions(5), 0..5);

        let range = PlaylistRange {
            start: Some(2),
            limit: Some(2),
        };
        assert_eq!(range.positions(5), 1..3);
        assert_eq!(range.positions(1), 1..1);

        let tail = PlaylistRange {
            start: Some(4),
            limit: None,
        };
        assert_eq!(tail.positions(5), 3..5);
    }

    #[test]
    fn job_request_falls_back_to_config() {
        let config = EngineConfig {
            output_dir: PathBuf::from("/music"),
            ..Default::default()
        };
        let request = SourceDescriptor::video("https://a.example/1").job_request(&config);
        assert_eq!(request.output_dir, PathBuf::from("/music"));
        assert_eq!(request.output_template, "{title}.{ext}");
        assert_eq!(request.audio_codec, AudioCodec::Mp3);
    }
}
