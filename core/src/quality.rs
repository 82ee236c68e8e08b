use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{BackendError, EngineError};
use crate::extractor::{FormatInfo, VideoInfo};
use crate::job::DownloadType;

/// Quality presets offered to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum QualityPreset {
    /// Highest resolution and bitrate available
    #[default]
    Best,
    P1080,
    P720,
    P480,
    P360,
    /// Smallest file the site offers
    Smallest,
}

impl QualityPreset {
    pub const ALL: [QualityPreset; 6] = [
        QualityPreset::Best,
        QualityPreset::P1080,
        QualityPreset::P720,
        QualityPreset::P480,
        QualityPreset::P360,
        QualityPreset::Smallest,
    ];

    pub fn max_height(self) -> Option<u32> {
        match self {
            QualityPreset::P1080 => Some(1080),
            QualityPreset::P720 => Some(720),
            QualityPreset::P480 => Some(480),
            QualityPreset::P360 => Some(360),
            QualityPreset::Best | QualityPreset::Smallest => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            QualityPreset::Best => "best",
            QualityPreset::P1080 => "1080p",
            QualityPreset::P720 => "720p",
            QualityPreset::P480 => "480p",
            QualityPreset::P360 => "360p",
            QualityPreset::Smallest => "smallest",
        }
    }
}

impl fmt::Display for QualityPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for QualityPreset {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "best" | "highest" => Ok(QualityPreset::Best),
            "1080" | "1080p" => Ok(QualityPreset::P1080),
            "720" | "720p" => Ok(QualityPreset::P720),
            "480" | "480p" => Ok(QualityPreset::P480),
            "360" | "360p" => Ok(QualityPreset::P360),
            "smallest" | "worst" | "lowest" => Ok(QualityPreset::Smallest),
            other => Err(EngineError::InvalidDescriptor(format!("unknown quality: {other}"))),
        }
    }
}

/// Either a preset or an explicit backend format id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormatSelection {
    Preset(QualityPreset),
    FormatId(String),
}

impl Default for FormatSelection {
    fn default() -> Self {
        FormatSelection::Preset(QualityPreset::Best)
    }
}

impl fmt::Display for FormatSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatSelection::Preset(preset) => write!(f, "{preset}"),
            FormatSelection::FormatId(id) => write!(f, "format {id}"),
        }
    }
}

/// Backend format selector and container for a resolved item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatPlan {
    pub selector: String,
    /// Container of the raw download.
    pub ext: String,
    pub estimated_size: Option<u64>,
    /// Short quality label for `{quality}` in output templates.
    pub quality_label: String,
}

/// Selector string understood by yt-dlp style backends.
pub fn format_selector(download_type: DownloadType, selection: &FormatSelection) -> String {
    let preset = match selection {
        FormatSelection::FormatId(id) => return id.clone(),
        FormatSelection::Preset(preset) => *preset,
    };

    match (download_type, preset) {
        (DownloadType::AudioOnly, QualityPreset::Smallest) => "worstaudio/worst".to_string(),
        (DownloadType::AudioOnly, _) => "bestaudio/best".to_string(),
        (DownloadType::VideoOnly, QualityPreset::Smallest) => "worstvideo".to_string(),
        (DownloadType::VideoOnly, preset) => match preset.max_height() {
            Some(h) => format!("bestvideo[height<={h}]"),
            None => "bestvideo".to_string(),
        },
        (DownloadType::VideoAudio, QualityPreset::Smallest) => {
            "worstvideo+worstaudio/worst".to_string()
        }
        (DownloadType::VideoAudio, preset) => match preset.max_height() {
            Some(h) => format!("bestvideo[height<={h}]+bestaudio/best[height<={h}]"),
            None => "bestvideo+bestaudio/best".to_string(),
        },
    }
}

/// Pick the selector and raw container for a resolved item.
///
/// An explicit format id must be one the item offers, when the backend
/// reported its formats at all.
pub fn plan_format(
    info: &VideoInfo,
    download_type: DownloadType,
    selection: &FormatSelection,
) -> Result<FormatPlan, BackendError> {
    let selector = format_selector(download_type, selection);

    if let FormatSelection::FormatId(id) = selection {
        if info.formats.is_empty() {
            return Ok(FormatPlan {
                selector,
                ext: default_container(download_type).to_string(),
                estimated_size: None,
                quality_label: id.clone(),
            });
        }
        let format = info
            .formats
            .iter()
            .find(|f| &f.format_id == id)
            .ok_or_else(|| BackendError::FormatUnavailable(format!("{id} is not offered for {}", info.id)))?;
        return Ok(FormatPlan {
            selector,
            ext: format.ext.clone(),
            estimated_size: format.filesize,
            quality_label: format_label(format),
        });
    }

    let preset = match selection {
        FormatSelection::Preset(preset) => *preset,
        FormatSelection::FormatId(_) => QualityPreset::Best,
    };
    let video = best_video_format(info, preset);
    let audio = best_audio_format(info, preset);

    let (ext, estimated_size, quality_label) = match download_type {
        DownloadType::AudioOnly => (
            audio.map_or_else(|| "m4a".to_string(), |f| f.ext.clone()),
            audio.and_then(|f| f.filesize),
            audio.map_or_else(|| "audio".to_string(), format_label),
        ),
        DownloadType::VideoOnly => (
            video.map_or_else(|| "mp4".to_string(), |f| f.ext.clone()),
            video.and_then(|f| f.filesize),
            video.map_or_else(|| preset.label().to_string(), format_label),
        ),
        DownloadType::VideoAudio => (
            default_container(download_type).to_string(),
            match (video.and_then(|f| f.filesize), audio.and_then(|f| f.filesize)) {
                (Some(v), Some(a)) => Some(v + a),
                (Some(v), None) => Some(v),
                _ => None,
            },
            video.map_or_else(|| preset.label().to_string(), format_label),
        ),
    };

    Ok(FormatPlan {
        selector,
        ext,
        estimated_size,
        quality_label,
    })
}

/// Merged video and audio streams are muxed into Matroska.
fn default_container(download_type: DownloadType) -> &'static str {
    match download_type {
        DownloadType::VideoAudio => "mkv",
        DownloadType::VideoOnly => "mp4",
        DownloadType::AudioOnly => "m4a",
    }
}

fn format_label(format: &FormatInfo) -> String {
    match (format.height, format.abr) {
        (Some(h), _) => format!("{h}p"),
        (None, Some(abr)) => format!("{}k", abr.round() as u32),
        _ => format.format_note.clone().unwrap_or_else(|| format.format_id.clone()),
    }
}

/// Video stream a preset would pick among the item's formats.
pub fn best_video_format(info: &VideoInfo, preset: QualityPreset) -> Option<&FormatInfo> {
    let candidates = info
        .formats
        .iter()
        .filter(|f| f.has_video() && f.height.is_some());
    match preset {
        QualityPreset::Smallest => candidates.min_by_key(|f| f.height.unwrap_or(0)),
        preset => {
            let cap = preset.max_height().unwrap_or(u32::MAX);
            candidates
                .filter(|f| f.height.unwrap_or(0) <= cap)
                .max_by_key(|f| (f.height.unwrap_or(0), f.vbr.unwrap_or(0.0) as u32))
        }
    }
}

/// Audio-only stream a preset would pick among the item's formats.
pub fn best_audio_format(info: &VideoInfo, preset: QualityPreset) -> Option<&FormatInfo> {
    let candidates = info.formats.iter().filter(|f| f.is_audio_only());
    if preset == QualityPreset::Smallest {
        candidates.min_by_key(|f| f.abr.unwrap_or(0.0) as u32)
    } else {
        candidates.max_by_key(|f| f.abr.unwrap_or(0.0) as u32)
    }
}

/// Available quality options for a video
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityOptions {
    pub audio_qualities: Vec<AudioQuality>,
    pub video_qualities: Vec<VideoQuality>,
    pub best_audio: Option<AudioQuality>,
    pub best_video: Option<VideoQuality>,
    /// Presets that select something different from each other on this item.
    pub presets: Vec<QualityPreset>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioQuality {
    pub format_id: String,
    pub bitrate: u32,
    pub codec: String,
    pub ext: String,
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoQuality {
    pub format_id: String,
    pub resolution: String,
    pub width: Option<u32>,
    pub height: u32,
    pub fps: Option<f32>,
    pub codec: String,
    pub ext: String,
    pub file_size: Option<u64>,
}

/// Analyze available qualities from video info
pub fn analyze_available_qualities(info: &VideoInfo) -> QualityOptions {
    let mut audio_qualities: Vec<AudioQuality> = info
        .formats
        .iter()
        .filter(|f| f.is_audio_only())
        .map(|f| AudioQuality {
            format_id: f.format_id.clone(),
            bitrate: f.abr.unwrap_or(0.0).round() as u32,
            codec: f.acodec.clone().unwrap_or_default(),
            ext: f.ext.clone(),
            file_size: f.filesize,
        })
        .collect();

    let mut video_qualities: Vec<VideoQuality> = info
        .formats
        .iter()
        .filter(|f| f.has_video())
        .filter_map(|f| {
            let height = f.height?;
            Some(VideoQuality {
                format_id: f.format_id.clone(),
                resolution: resolution_label(height),
                width: f.width,
                height,
                fps: f.fps,
                codec: f.vcodec.clone().unwrap_or_default(),
                ext: f.ext.clone(),
                file_size: f.filesize,
            })
        })
        .collect();

    audio_qualities.sort_by(|a, b| b.bitrate.cmp(&a.bitrate));
    video_qualities.sort_by(|a, b| b.height.cmp(&a.height));

    audio_qualities.dedup_by(|a, b| a.bitrate == b.bitrate && a.codec == b.codec);
    video_qualities.dedup_by(|a, b| a.height == b.height);

    let max_height = video_qualities.first().map(|v| v.height);
    let presets = QualityPreset::ALL
        .into_iter()
        .filter(|preset| match (preset.max_height(), max_height) {
            // a cap at or above the best stream picks the same thing as Best
            (Some(cap), Some(max)) => cap < max && video_qualities.iter().any(|v| v.height <= cap),
            (Some(_), None) => false,
            (None, _) => true,
        })
        .collect();

    QualityOptions {
        best_audio: audio_qualities.first().cloned(),
        best_video: video_qualities.first().cloned(),
        audio_qualities,
        video_qualities,
        presets,
    }
}

fn resolution_label(height: u32) -> String {
    match height {
        2160 => "4K (2160p)".to_string(),
        h => format!("{h}p"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(id: &str, height: Option<u32>, abr: Option<f32>, size: Option<u64>) -> FormatInfo {
        FormatInfo {
            format_id: id.to_string(),
            ext: if height.is_some() { "mp4" } else { "m4a" }.to_string(),
            format_note: None,
            acodec: if height.is_some() { None } else { Some("mp4a.40.2".into()) },
            vcodec: height.map(|_| "avc1".to_string()),
            width: None,
            height,
            fps: None,
            abr,
            vbr: None,
            filesize: size,
        }
    }

    fn info() -> VideoInfo {
        VideoInfo {
            id: "abc".into(),
            title: "Clip".into(),
            formats: vec![
                format("137", Some(1080), None, Some(9_000)),
                format("136", Some(720), None, Some(5_000)),
                format("135", Some(480), None, Some(2_000)),
                format("140", None, Some(128.0), Some(1_000)),
                format("139", None, Some(48.0), Some(400)),
            ],
            ..VideoInfo::default()
        }
    }

    #[test]
    fn selectors_follow_preset_and_type() {
        let sel = |t, p| format_selector(t, &FormatSelection::Preset(p));
        assert_eq!(sel(DownloadType::VideoAudio, QualityPreset::Best), "bestvideo+bestaudio/best");
        assert_eq!(
            sel(DownloadType::VideoAudio, QualityPreset::P720),
            "bestvideo[height<=720]+bestaudio/best[height<=720]"
        );
        assert_eq!(
            sel(DownloadType::VideoAudio, QualityPreset::Smallest),
            "worstvideo+worstaudio/worst"
        );
        assert_eq!(sel(DownloadType::AudioOnly, QualityPreset::P1080), "bestaudio/best");
        assert_eq!(sel(DownloadType::VideoOnly, QualityPreset::P480), "bestvideo[height<=480]");
        assert_eq!(
            format_selector(DownloadType::VideoAudio, &FormatSelection::FormatId("22".into())),
            "22"
        );
    }

    #[test]
    fn plan_for_capped_video_sums_sizes() {
        let plan = plan_format(&info(), DownloadType::VideoAudio, &FormatSelection::Preset(QualityPreset::P720))
            .unwrap();
        assert_eq!(plan.ext, "mkv");
        assert_eq!(plan.estimated_size, Some(6_000));
        assert_eq!(plan.quality_label, "720p");
    }

    #[test]
    fn plan_for_audio_uses_audio_stream() {
        let plan = plan_format(&info(), DownloadType::AudioOnly, &FormatSelection::default()).unwrap();
        assert_eq!(plan.ext, "m4a");
        assert_eq!(plan.estimated_size, Some(1_000));
        assert_eq!(plan.quality_label, "128k");
    }

    #[test]
    fn unknown_format_id_is_permanent() {
        let err = plan_format(&info(), DownloadType::VideoAudio, &FormatSelection::FormatId("999".into()))
            .unwrap_err();
        assert!(matches!(err, BackendError::FormatUnavailable(_)));
        assert_eq!(err.kind(), crate::error::ErrorKind::Permanent);
    }

    #[test]
    fn analysis_lists_distinct_presets() {
        let options = analyze_available_qualities(&info());
        assert_eq!(options.best_video.unwrap().height, 1080);
        assert_eq!(options.best_audio.unwrap().bitrate, 128);
        assert_eq!(
            options.presets,
            vec![
                QualityPreset::Best,
                QualityPreset::P720,
                QualityPreset::P480,
                QualityPreset::Smallest
            ]
        );
    }

    #[test]
    fn presets_parse_from_user_input() {
        assert_eq!("720p".parse::<QualityPreset>().unwrap(), QualityPreset::P720);
        assert_eq!("WORST".parse::<QualityPreset>().unwrap(), QualityPreset::Smallest);
        assert!("8k".parse::<QualityPreset>().is_err());
    }
}
