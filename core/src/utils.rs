use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

/// Longest file name component produced by `sanitize_filename`, in characters.
const MAX_NAME_CHARS: usize = 200;

fn invalid_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1f]"#).expect("invalid filename pattern"))
}

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{(\w*)\}").expect("invalid placeholder pattern"))
}

/// Sanitize filename for safe filesystem usage
pub fn sanitize_filename(name: &str) -> String {
    let sanitized = invalid_chars().replace_all(name, "_");
    let trimmed = sanitized.trim_matches(|c: char| c.is_whitespace() || c == '.');
    let limited: String = trimmed.chars().take(MAX_NAME_CHARS).collect();
    let limited = limited.trim_end();

    if limited.is_empty() {
        "untitled".to_string()
    } else {
        limited.to_string()
    }
}

/// Values available to output templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateValues {
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub index: Option<usize>,
    pub ext: Option<String>,
    pub quality: Option<String>,
    pub id: Option<String>,
}

impl TemplateValues {
    fn get(&self, key: &str) -> Option<String> {
        match key {
            "title" => self.title.clone(),
            "uploader" => self.uploader.clone(),
            "index" => self.index.map(|i| format!("{i:03}")),
            "ext" => self.ext.clone(),
            "quality" => self.quality.clone(),
            "id" => self.id.clone(),
            _ => None,
        }
    }
}

/// Render an output template into a path relative to the output directory.
///
/// Unknown or unresolved placeholders render as empty strings. `/` in the
/// template separates subdirectories; every component is sanitized and `..`
/// cannot escape the output directory.
pub fn render_template(template: &str, values: &TemplateValues) -> PathBuf {
    let rendered = placeholder().replace_all(template, |caps: &regex::Captures| {
        values
            .get(&caps[1])
            .map(|v| v.replace(['/', '\\'], "_"))
            .unwrap_or_default()
    });

    let parts: Vec<&str> = rendered
        .split(['/', '\\'])
        .map(str::trim)
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .collect();

    let mut path = PathBuf::new();
    let last = parts.len().saturating_sub(1);
    for (i, part) in parts.iter().enumerate() {
        if i == last {
            path.push(sanitize_file_stem(part));
        } else {
            path.push(sanitize_filename(part));
        }
    }
    if parts.is_empty() {
        path.push(sanitize_file_stem(""));
    }
    path
}

/// Like `sanitize_filename`, but a name that is only an extension (".mp4")
/// keeps it behind a placeholder stem.
fn sanitize_file_stem(name: &str) -> String {
    let trimmed = name.trim();
    match trimmed.strip_prefix('.') {
        Some(ext) if !ext.is_empty() && !ext.contains('.') => {
            format!("untitled.{}", sanitize_filename(ext))
        }
        _ => sanitize_filename(trimmed),
    }
}

/// `base` itself if free, else `base_1.ext`, `base_2.ext`, ...
pub fn unique_path(base: &Path) -> PathBuf {
    if !base.exists() {
        return base.to_path_buf();
    }
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "untitled".to_string());
    let ext = base.extension().map(|e| e.to_string_lossy().into_owned());
    let parent = base.parent().unwrap_or_else(|| Path::new(""));

    (1u32..)
        .map(|n| {
            let name = match &ext {
                Some(ext) => format!("{stem}_{n}.{ext}"),
                None => format!("{stem}_{n}"),
            };
            parent.join(name)
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| base.to_path_buf())
}

/// Whether `path` stays inside `root` once `..` and `.` are taken into account.
pub fn is_within(root: &Path, path: &Path) -> bool {
    let relative = match path.strip_prefix(root) {
        Ok(relative) => relative,
        Err(_) => return false,
    };
    let mut depth = 0i32;
    for component in relative.components() {
        match component {
            Component::ParentDir => depth -= 1,
            Component::Normal(_) => depth += 1,
            _ => {}
        }
        if depth < 0 {
            return false;
        }
    }
    true
}

/// Format duration from seconds to human-readable format
pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}

/// Parse `SS`, `MM:SS` or `HH:MM:SS`, each optionally with fractional seconds.
pub fn parse_timestamp(value: &str) -> Option<f64> {
    let parts: Vec<&str> = value.trim().split(':').collect();
    if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.trim().is_empty()) {
        return None;
    }

    let (last, rest) = parts.split_last()?;
    let seconds: f64 = last.trim().parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 || (!rest.is_empty() && seconds >= 60.0) {
        return None;
    }

    let mut total = seconds;
    let mut multiplier = 60.0;
    for (i, part) in rest.iter().rev().enumerate() {
        let value: u64 = part.trim().parse().ok()?;
        // minutes must stay below 60 when hours are present
        if i == 0 && rest.len() == 2 && value >= 60 {
            return None;
        }
        total += value as f64 * multiplier;
        multiplier *= 60.0;
    }
    Some(total)
}

/// Parse a rate such as `500K`, `1.5M` or `2000000` into bytes per second.
/// Suffixes are binary multiples, as yt-dlp reads them.
pub fn parse_rate_limit(value: &str) -> Option<u64> {
    let value = value.trim();
    let lower = value.to_lowercase();
    let lower = lower
        .strip_suffix("/s")
        .unwrap_or(lower.as_str())
        .trim_end_matches(['b', 'B'])
        .to_string();
    let (number, multiplier) = match lower.chars().last()? {
        'k' => (&lower[..lower.len() - 1], 1024.0),
        'm' => (&lower[..lower.len() - 1], 1024.0 * 1024.0),
        'g' => (&lower[..lower.len() - 1], 1024.0 * 1024.0 * 1024.0),
        _ => (lower.as_str(), 1.0),
    };
    let number: f64 = number.trim().parse().ok()?;
    if !number.is_finite() || number <= 0.0 {
        return None;
    }
    Some((number * multiplier).round() as u64)
}

/// Get number of CPU cores for optimal threading
pub fn get_optimal_thread_count() -> usize {
    let cpu_count = num_cpus::get();
    // Use 75% of available cores, minimum 1, maximum 8
    ((cpu_count * 3) / 4).clamp(1, 8)
}

/// Format bytes as human-readable size
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", size as u64, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

pub fn format_speed(bytes_per_sec: f64) -> String {
    if bytes_per_sec <= 0.0 || !bytes_per_sec.is_finite() {
        return "0 B/s".to_string();
    }
    format!("{}/s", format_bytes(bytes_per_sec as u64))
}

/// Create directory if it doesn't exist
pub async fn ensure_directory_exists(path: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(path).await
}
