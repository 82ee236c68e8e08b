#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use ytgrab_core::{
    BackendError, BatchId, BatchProgress, Engine, EngineConfig, ExtractionBackend, MediaStream,
    MediaTranscoder, Metadata, PlaylistEntry, PlaylistInfo, QueueSnapshot, StreamRequest,
    TranscodeError, TranscodeRequest, VideoInfo,
};

#[derive(Debug, Clone)]
pub struct FakeItem {
    pub title: String,
    pub uploader: Option<String>,
    pub size: u64,
    pub duration: f64,
}

#[derive(Default)]
struct Script {
    items: HashMap<String, FakeItem>,
    playlists: HashMap<String, PlaylistInfo>,
    stream_failures: HashMap<String, u32>,
    resolve_failures: HashMap<String, u32>,
    not_found: HashSet<String>,
}

/// In-memory extraction backend with scripted failures.
pub struct FakeBackend {
    script: Mutex<Script>,
    resume: bool,
    chunk_delay: Duration,
    resolve_delay: Duration,
    pub resolves: AtomicUsize,
    pub streams_opened: AtomicUsize,
    pub offsets: Mutex<Vec<u64>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script::default()),
            resume: false,
            chunk_delay: Duration::ZERO,
            resolve_delay: Duration::ZERO,
            resolves: AtomicUsize::new(0),
            streams_opened: AtomicUsize::new(0),
            offsets: Mutex::new(Vec::new()),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_resume(mut self) -> Self {
        self.resume = true;
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Every metadata lookup takes this long.
    pub fn with_resolve_delay(mut self, delay: Duration) -> Self {
        self.resolve_delay = delay;
        self
    }

    pub fn video(self, url: &str, title: &str, size: u64) -> Self {
        self.script.lock().items.insert(
            url.to_string(),
            FakeItem {
                title: title.to_string(),
                uploader: Some("Uploader".to_string()),
                size,
                duration: 120.0,
            },
        );
        self
    }

    pub fn failing_streams(self, url: &str, failures: u32) -> Self {
        self.script.lock().stream_failures.insert(url.to_string(), failures);
        self
    }

    pub fn failing_resolves(self, url: &str, failures: u32) -> Self {
        self.script.lock().resolve_failures.insert(url.to_string(), failures);
        self
    }

    pub fn missing(self, url: &str) -> Self {
        self.script.lock().not_found.insert(url.to_string());
        self
    }

    pub fn playlist(self, url: &str, title: &str, member_urls: &[&str]) -> Self {
        let entries = member_urls
            .iter()
            .enumerate()
            .map(|(i, member)| PlaylistEntry {
                id: Some(format!("m{i}")),
                title: Some(format!("Member {}", i + 1)),
                url: Some(member.to_string()),
                ..Default::default()
            })
            .collect();
        self.playlist_entries(url, title, entries)
    }

    pub fn playlist_entries(self, url: &str, title: &str, entries: Vec<PlaylistEntry>) -> Self {
        self.script.lock().playlists.insert(
            url.to_string(),
            PlaylistInfo {
                id: "PL1".to_string(),
                title: title.to_string(),
                uploader: None,
                entries,
            },
        );
        self
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn item(&self, url: &str) -> FakeItem {
        self.script.lock().items.get(url).cloned().unwrap_or_else(|| FakeItem {
            title: url.rsplit('/').next().unwrap_or("item").to_string(),
            uploader: None,
            size: 8 * 1024,
            duration: 60.0,
        })
    }
}

#[async_trait]
impl ExtractionBackend for FakeBackend {
    async fn resolve_metadata(&self, url: &str) -> Result<Metadata, BackendError> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        if !self.resolve_delay.is_zero() {
            tokio::time::sleep(self.resolve_delay).await;
        }
        {
            let mut script = self.script.lock();
            if script.not_found.contains(url) {
                return Err(BackendError::NotFound(format!("{url} was removed")));
            }
            if let Some(left) = script.resolve_failures.get_mut(url) {
                if *left > 0 {
                    *left -= 1;
                    return Err(BackendError::RateLimited("HTTP Error 429".into()));
                }
            }
            if let Some(list) = script.playlists.get(url) {
                return Ok(Metadata::Playlist(list.clone()));
            }
        }

        let item = self.item(url);
        Ok(Metadata::Video(VideoInfo {
            id: "vid".to_string(),
            title: item.title,
            uploader: item.uploader,
            duration: Some(item.duration),
            webpage_url: Some(url.to_string()),
            ..Default::default()
        }))
    }

    async fn open_stream(&self, request: StreamRequest) -> Result<Box<dyn MediaStream>, BackendError> {
        self.streams_opened.fetch_add(1, Ordering::SeqCst);
        self.offsets.lock().push(request.offset);

        let fail = {
            let mut script = self.script.lock();
            match script.stream_failures.get_mut(&request.url) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };
        let item = self.item(&request.url);

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        Ok(Box::new(FakeStream {
            total: item.size,
            remaining: item.size.saturating_sub(request.offset),
            sent: 0,
            fail,
            delay: self.chunk_delay,
            active: self.active.clone(),
        }))
    }

    fn supports_resume(&self) -> bool {
        self.resume
    }
}

struct FakeStream {
    total: u64,
    remaining: u64,
    sent: u64,
    fail: bool,
    delay: Duration,
    active: Arc<AtomicUsize>,
}

#[async_trait]
impl MediaStream for FakeStream {
    fn total_bytes(&self) -> Option<u64> {
        Some(self.total)
    }

    async fn next_chunk(&mut self, max: usize) -> Result<Option<Bytes>, BackendError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail && self.sent > 0 {
            return Err(BackendError::Network("connection reset by peer".into()));
        }
        if self.remaining == 0 {
            return Ok(None);
        }
        let n = (max as u64).min(self.remaining);
        self.remaining -= n;
        self.sent += n;
        Ok(Some(Bytes::from(vec![0xAB; n as usize])))
    }

    async fn finish(self: Box<Self>) -> Result<(), BackendError> {
        Ok(())
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Transcoder that copies the input, with scripted failures.
#[derive(Default)]
pub struct FakeTranscoder {
    corrupt_inputs: AtomicU32,
    unsupported: bool,
    delay: Duration,
    pub requests: Mutex<Vec<TranscodeRequest>>,
}

impl FakeTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` inputs as unreadable.
    pub fn corrupt_inputs(self, n: u32) -> Self {
        self.corrupt_inputs.store(n, Ordering::SeqCst);
        self
    }

    pub fn unsupported(mut self) -> Self {
        self.unsupported = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl MediaTranscoder for FakeTranscoder {
    async fn transcode(
        &self,
        request: TranscodeRequest,
        progress: &(dyn Fn(f64) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<(), TranscodeError> {
        self.requests.lock().push(request.clone());

        let corrupt = self
            .corrupt_inputs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if corrupt {
            return Err(TranscodeError::InvalidInput("moov atom not found".into()));
        }
        if self.unsupported {
            return Err(TranscodeError::UnsupportedCodec("Unknown encoder 'libmp3lame'".into()));
        }

        progress(50.0);
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tokio::fs::remove_file(&request.output).await;
                return Err(TranscodeError::Cancelled);
            }
            _ = tokio::time::sleep(self.delay) => {}
        }
        tokio::fs::copy(&request.input, &request.output).await?;
        progress(100.0);
        Ok(())
    }
}

pub fn test_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        output_dir: dir.to_path_buf(),
        history_path: None,
        max_concurrent: 3,
        chunk_size: 4096,
        retry_base_delay_ms: 5,
        network_timeout_secs: 5,
        progress_interval_ms: 5,
        ..Default::default()
    }
}

pub fn engine(config: EngineConfig, backend: &Arc<FakeBackend>, transcoder: &Arc<FakeTranscoder>) -> Engine {
    let backend: Arc<dyn ExtractionBackend> = backend.clone();
    let transcoder: Arc<dyn MediaTranscoder> = transcoder.clone();
    Engine::new(config, backend, transcoder).expect("engine")
}

pub async fn finish(engine: &Engine, batch: BatchId) -> BatchProgress {
    tokio::time::timeout(Duration::from_secs(20), engine.wait_for_batch(batch))
        .await
        .expect("batch did not finish in time")
        .expect("batch is known")
}

pub async fn wait_until(engine: &Engine, what: &str, done: impl Fn(&QueueSnapshot) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if done(&engine.snapshot()) {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Regular files below `dir`, recursively.
pub fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return files;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            files.extend(files_under(&path));
        } else {
            files.push(path);
        }
    }
    files.sort();
    files
}
