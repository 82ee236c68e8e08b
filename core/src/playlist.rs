use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::batch::{BatchId, BatchStatus};
use crate::error::{ErrorKind, JobError};
use crate::extractor::{ExtractionBackend, Metadata, PlaylistEntry, PlaylistInfo};
use crate::job::{Job, JobRequest};
use crate::queue::QueueManager;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::source::PlaylistRange;

/// Turns a playlist URL into member jobs of one batch.
pub struct PlaylistExpander {
    queue: Arc<QueueManager>,
    backend: Arc<dyn ExtractionBackend>,
    retry: RetryPolicy,
    timeout: std::time::Duration,
}

impl PlaylistExpander {
    pub fn new(
        queue: Arc<QueueManager>,
        backend: Arc<dyn ExtractionBackend>,
        retry: RetryPolicy,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            queue,
            backend,
            retry,
            timeout,
        }
    }

    /// List the playlist and enqueue its members in listing order. Stops early
    /// when `cancel` fires; the batch is then already marked cancelled.
    pub async fn expand(
        self,
        batch_id: BatchId,
        url: String,
        request: JobRequest,
        range: PlaylistRange,
        cancel: CancellationToken,
    ) {
        let listing = match self.list(&url, &cancel).await {
            Some(Ok(listing)) => listing,
            Some(Err(err)) => {
                warn!("Playlist {} could not be listed: {}", url, err);
                self.queue.finish_expansion(batch_id, BatchStatus::Failed(err));
                return;
            }
            None => return,
        };

        self.queue.set_batch_title(batch_id, Some(listing.title.clone()));
        let positions = range.positions(listing.entries.len());
        info!(
            "Expanding playlist {:?}: {} of {} entries",
            listing.title,
            positions.len(),
            listing.entries.len()
        );

        for position in positions {
            if cancel.is_cancelled() {
                return;
            }
            let entry = &listing.entries[position];
            let index = position + 1;

            let added = match entry.download_url() {
                Ok(member_url) => {
                    let job = Job::new(batch_id, member_url, &request)
                        .in_playlist(listing.id.clone(), index)
                        .with_title(entry.title.clone());
                    self.queue.add_job(job)
                }
                Err(reason) => {
                    let job = Job::new(batch_id, entry_label(&url, entry.id.as_deref()), &request)
                        .in_playlist(listing.id.clone(), index)
                        .with_title(entry.title.clone());
                    let error = JobError::new(
                        ErrorKind::Permanent,
                        format!("playlist entry {index} is unavailable: {reason}"),
                    );
                    self.queue.add_failed_job(job, error)
                }
            };
            if let Err(e) = added {
                // batch cancelled or engine stopped
                info!("Stopped expanding playlist {}: {}", url, e);
                return;
            }
        }

        self.queue.finish_expansion(batch_id, BatchStatus::Ready);
    }

    /// `None` when cancelled.
    async fn list(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Option<Result<PlaylistInfo, JobError>> {
        let mut attempt = 1;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                r = tokio::time::timeout(self.timeout, self.backend.resolve_metadata(url)) => r,
            };

            let err = match result {
                Ok(Ok(Metadata::Playlist(listing))) => return Some(Ok(listing)),
                // a single item behind a playlist-looking URL is a one-member playlist
                Ok(Ok(Metadata::Video(info))) => {
                    return Some(Ok(PlaylistInfo {
                        id: info.id.clone(),
                        title: info.title.clone(),
                        uploader: info.uploader.clone(),
                        entries: vec![PlaylistEntry {
                            id: Some(info.id.clone()),
                            title: Some(info.title.clone()),
                            url: Some(info.webpage_url.clone().unwrap_or_else(|| url.to_string())),
                            duration: info.duration,
                            uploader: info.uploader.clone(),
                            unavailable: None,
                        }],
                    }))
                }
                Ok(Err(e)) => e.to_job_error(),
                Err(_) => JobError::new(
                    ErrorKind::Transient,
                    format!("playlist listing timed out after {}s", self.timeout.as_secs()),
                ),
            };

            match self.retry.decide(attempt, err) {
                RetryDecision::RetryAfter(delay) => {
                    warn!("Listing {} failed (attempt {}), retrying in {:?}", url, attempt, delay);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                RetryDecision::GiveUp(err) => return Some(Err(err)),
            }
        }
    }
}

/// Something to show for an entry that has no usable URL.
fn entry_label(playlist_url: &str, id: Option<&str>) -> String {
    match id {
        Some(id) if !id.is_empty() => format!("{playlist_url}#{id}"),
        _ => playlist_url.to_string(),
    }
}
