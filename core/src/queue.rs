use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::batch::{Batch, BatchId, BatchProgress, BatchStatus};
use crate::error::{EngineError, JobError, Result};
use crate::events::{EventBus, QueueEvent, Subscription};
use crate::history::{HistoryRecord, HistoryStore};
use crate::job::{Job, JobId, JobProgress, JobState};
use crate::progress::aggregate_batch;

/// How a paused job continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResumeMode {
    /// The partial download was kept and continues at `offset`.
    Continue { offset: u64 },
    /// Nothing was kept; the transfer starts again from zero.
    Restart,
}

/// Signals from the queue to the executor running a job.
#[derive(Debug, Clone, Default)]
pub struct JobControl {
    pub cancel: CancellationToken,
    pub pause: CancellationToken,
}

/// A job handed to an executor.
#[derive(Debug)]
pub struct DispatchTicket {
    pub job: Job,
    pub control: JobControl,
    /// Set when a paused download is being resumed.
    pub resume: Option<ResumeMode>,
}

/// Consistent copy of the queue for the shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Jobs in submission order.
    pub jobs: Vec<Job>,
    pub batches: Vec<Batch>,
}

impl QueueSnapshot {
    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.iter().find(|job| job.id == id)
    }

    pub fn count(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|job| job.state == state).count()
    }
}

#[derive(Debug, Clone)]
struct PauseInfo {
    from: JobState,
    mode: ResumeMode,
    resume_requested: bool,
}

#[derive(Debug)]
struct JobEntry {
    job: Job,
    /// Present while an executor owns the job.
    control: Option<JobControl>,
    paused: Option<PauseInfo>,
}

#[derive(Debug)]
struct BatchEntry {
    batch: Batch,
    expansion: CancellationToken,
}

#[derive(Debug)]
struct QueueState {
    jobs: HashMap<JobId, JobEntry>,
    order: Vec<JobId>,
    /// Dispatch order. Holds queued jobs, queued jobs that were paused (in
    /// place) and paused downloads waiting to be resumed.
    pending: VecDeque<JobId>,
    batches: HashMap<BatchId, BatchEntry>,
    batch_order: Vec<BatchId>,
    accepting: bool,
}

/// Single source of truth for jobs and batches.
///
/// Every mutation happens under one lock, and the matching event is published
/// before the lock is released, so observers see changes in the order they
/// happened.
#[derive(Debug)]
pub struct QueueManager {
    state: Mutex<QueueState>,
    events: EventBus,
    history: Arc<HistoryStore>,
    revision: watch::Sender<u64>,
    dispatch: Notify,
}

impl QueueManager {
    pub fn new(observer_capacity: usize, history: Arc<HistoryStore>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            state: Mutex::new(QueueState {
                jobs: HashMap::new(),
                order: Vec::new(),
                pending: VecDeque::new(),
                batches: HashMap::new(),
                batch_order: Vec::new(),
                accepting: true,
            }),
            events: EventBus::new(observer_capacity),
            history,
            revision,
            dispatch: Notify::new(),
        }
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    /// Fires when there may be something new to dispatch.
    pub(crate) fn dispatch_signal(&self) -> &Notify {
        &self.dispatch
    }

    pub fn is_accepting(&self) -> bool {
        self.state.lock().accepting
    }

    // ----- batches -----

    /// Register a batch. Returns the token that stops its playlist expansion.
    pub fn open_batch(&self, batch: Batch) -> Result<CancellationToken> {
        let mut state = self.state.lock();
        if !state.accepting {
            return Err(EngineError::EngineStopped);
        }
        let expansion = CancellationToken::new();
        let id = batch.id;
        self.events.publish(QueueEvent::BatchChanged {
            batch_id: id,
            status: batch.status.clone(),
            job_count: 0,
        });
        state.batch_order.push(id);
        state.batches.insert(
            id,
            BatchEntry {
                batch,
                expansion: expansion.clone(),
            },
        );
        Ok(expansion)
    }

    pub fn set_batch_title(&self, batch_id: BatchId, title: Option<String>) {
        if let Some(entry) = self.state.lock().batches.get_mut(&batch_id) {
            entry.batch.title = title;
        }
    }

    /// End of playlist expansion. A batch cancelled meanwhile stays cancelled.
    pub fn finish_expansion(&self, batch_id: BatchId, status: BatchStatus) {
        let mut state = self.state.lock();
        let Some(entry) = state.batches.get_mut(&batch_id) else {
            return;
        };
        if entry.batch.status != BatchStatus::Expanding {
            return;
        }
        entry.batch.status = status.clone();
        let job_count = entry.batch.job_ids.len();
        self.events.publish(QueueEvent::BatchChanged {
            batch_id,
            status,
            job_count,
        });
        drop(state);
        self.bump();
    }

    pub fn batch(&self, batch_id: BatchId) -> Option<Batch> {
        self.state.lock().batches.get(&batch_id).map(|e| e.batch.clone())
    }

    pub fn batch_progress(&self, batch_id: BatchId) -> Option<BatchProgress> {
        let state = self.state.lock();
        let entry = state.batches.get(&batch_id)?;
        let members = entry
            .batch
            .job_ids
            .iter()
            .filter_map(|id| state.jobs.get(id).map(|e| &e.job));
        Some(aggregate_batch(&entry.batch, members))
    }

    // ----- jobs -----

    /// Insert jobs at the back of the pending queue, in order, atomically.
    pub fn add_jobs(&self, jobs: Vec<Job>) -> Result<Vec<JobId>> {
        let mut state = self.state.lock();
        if !state.accepting {
            return Err(EngineError::EngineStopped);
        }
        for job in &jobs {
            match state.batches.get(&job.batch_id) {
                None => return Err(EngineError::unknown_batch(job.batch_id)),
                Some(entry) if entry.batch.status == BatchStatus::Cancelled => {
                    return Err(EngineError::NotFoundOrTerminal(job.batch_id.to_string()))
                }
                Some(_) => {}
            }
        }

        let mut ids = Vec::with_capacity(jobs.len());
        for mut job in jobs {
            job.state = JobState::Queued;
            let id = job.id;
            if let Some(entry) = state.batches.get_mut(&job.batch_id) {
                entry.batch.job_ids.push(id);
            }
            self.events.publish(QueueEvent::JobAdded {
                job: Box::new(job.clone()),
            });
            state.order.push(id);
            state.pending.push_back(id);
            state.jobs.insert(
                id,
                JobEntry {
                    job,
                    control: None,
                    paused: None,
                },
            );
            ids.push(id);
        }
        drop(state);

        self.bump();
        self.dispatch.notify_one();
        Ok(ids)
    }

    pub fn add_job(&self, job: Job) -> Result<JobId> {
        let mut ids = self.add_jobs(vec![job])?;
        ids.pop().ok_or(EngineError::EngineStopped)
    }

    /// Insert a job that can never run, e.g. a private playlist member.
    /// Observers see it queued and then failed.
    pub fn add_failed_job(&self, job: Job, error: JobError) -> Result<JobId> {
        let id = job.id;
        let mut state = self.state.lock();
        if !state.accepting {
            return Err(EngineError::EngineStopped);
        }
        match state.batches.get_mut(&job.batch_id) {
            Some(entry) if entry.batch.status != BatchStatus::Cancelled => entry.batch.job_ids.push(id),
            _ => return Err(EngineError::unknown_batch(job.batch_id)),
        }
        self.events.publish(QueueEvent::JobAdded {
            job: Box::new(job.clone()),
        });
        state.order.push(id);
        state.jobs.insert(
            id,
            JobEntry {
                job,
                control: None,
                paused: None,
            },
        );
        self.transition_locked(&mut state, id, JobState::Failed, |job| {
            job.error = Some(error);
        })?;
        drop(state);
        self.bump();
        Ok(id)
    }

    pub fn job(&self, id: JobId) -> Option<Job> {
        self.state.lock().jobs.get(&id).map(|e| e.job.clone())
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock();
        QueueSnapshot {
            jobs: state
                .order
                .iter()
                .filter_map(|id| state.jobs.get(id).map(|e| e.job.clone()))
                .collect(),
            batches: state
                .batch_order
                .iter()
                .filter_map(|id| state.batches.get(id).map(|e| e.batch.clone()))
                .collect(),
        }
    }

    /// Jobs currently owned by an executor.
    pub fn active_count(&self) -> usize {
        self.state
            .lock()
            .jobs
            .values()
            .filter(|e| e.control.is_some())
            .count()
    }

    /// Pending job ids in dispatch order.
    pub fn pending_order(&self) -> Vec<JobId> {
        self.state.lock().pending.iter().copied().collect()
    }

    // ----- executor side -----

    /// Hand the next eligible job to an executor, strictly in pending order.
    pub fn next_dispatch(&self) -> Option<DispatchTicket> {
        let mut state = self.state.lock();
        if !state.accepting {
            return None;
        }

        let QueueState { jobs, pending, .. } = &mut *state;
        pending.retain(|id| {
            jobs.get(id)
                .is_some_and(|e| matches!(e.job.state, JobState::Queued | JobState::Paused))
        });
        let position = pending.iter().position(|id| {
            jobs.get(id).is_some_and(|e| match e.job.state {
                JobState::Queued => true,
                JobState::Paused => e.paused.as_ref().is_some_and(|p| p.resume_requested),
                _ => false,
            })
        })?;
        let id = pending.remove(position)?;
        let entry = jobs.get_mut(&id)?;

        let from = entry.job.state;
        let (to, resume) = match from {
            JobState::Queued => (JobState::Resolving, None),
            _ => (JobState::Downloading, entry.paused.take().map(|p| p.mode)),
        };
        entry.job.state = to;
        if to == JobState::Resolving {
            entry.job.started_at = Some(Utc::now());
        }
        let control = JobControl::default();
        entry.control = Some(control.clone());
        let job = entry.job.clone();

        self.publish_state(&job, from);
        drop(state);
        self.bump();

        debug!("Dispatched job {} ({} -> {})", job.id, from, to);
        Some(DispatchTicket {
            job,
            control,
            resume,
        })
    }

    /// Validated state change requested by an executor.
    pub fn transition(&self, id: JobId, to: JobState, apply: impl FnOnce(&mut Job)) -> Result<Job> {
        let mut state = self.state.lock();
        let job = self.transition_locked(&mut state, id, to, apply)?;
        drop(state);
        self.bump();
        Ok(job)
    }

    /// Downloading -> Paused, remembering how the transfer can continue.
    pub fn mark_paused(&self, id: JobId, mode: ResumeMode) -> Result<Job> {
        let mut state = self.state.lock();
        let job = self.transition_locked(&mut state, id, JobState::Paused, |job| {
            if let Some(progress) = &mut job.progress {
                progress.speed_bps = 0.0;
                progress.eta_secs = None;
            }
        })?;
        if let Some(entry) = state.jobs.get_mut(&id) {
            entry.paused = Some(PauseInfo {
                from: JobState::Downloading,
                mode,
                resume_requested: false,
            });
        }
        drop(state);
        self.bump();
        Ok(job)
    }

    /// Replace the job's pause token with a fresh one, dropping a pause that
    /// arrived too late to stop the transfer. Only valid outside `Downloading`.
    pub fn renew_pause(&self, id: JobId) -> Option<CancellationToken> {
        let mut state = self.state.lock();
        let entry = state.jobs.get_mut(&id)?;
        if entry.job.state == JobState::Downloading {
            return None;
        }
        let control = entry.control.as_mut()?;
        control.pause = CancellationToken::new();
        Some(control.pause.clone())
    }

    /// Metadata change without a state change.
    pub fn update_job(&self, id: JobId, apply: impl FnOnce(&mut Job)) -> Option<Job> {
        let mut state = self.state.lock();
        let entry = state.jobs.get_mut(&id)?;
        if entry.job.state.is_terminal() {
            return None;
        }
        apply(&mut entry.job);
        let job = entry.job.clone();
        self.events.publish(QueueEvent::JobUpdated {
            job: Box::new(job.clone()),
        });
        Some(job)
    }

    /// Record progress of the current stage. Ignored outside Downloading and PostProcessing.
    pub fn report_progress(&self, id: JobId, progress: JobProgress) {
        let mut state = self.state.lock();
        let Some(entry) = state.jobs.get_mut(&id) else {
            return;
        };
        if !matches!(entry.job.state, JobState::Downloading | JobState::PostProcessing) {
            return;
        }
        let merged = match &mut entry.job.progress {
            Some(current) => {
                current.merge_monotonic(progress);
                current.clone()
            }
            None => {
                entry.job.progress = Some(progress.clone());
                progress
            }
        };
        self.events.publish(QueueEvent::Progress {
            job_id: id,
            progress: merged,
        });
    }

    // ----- shell side -----

    /// Cancel one job. Jobs owned by an executor are signalled and this waits
    /// until the executor reached a safe checkpoint and finished the job.
    pub async fn cancel_job(&self, id: JobId) -> Result<JobState> {
        let (signalled, partial) = {
            let mut state = self.state.lock();
            let entry = state.jobs.get_mut(&id).ok_or_else(|| EngineError::unknown_job(id))?;
            match entry.job.state {
                JobState::Cancelled => return Ok(JobState::Cancelled),
                JobState::Completed | JobState::Failed => return Err(EngineError::unknown_job(id)),
                _ => {}
            }
            match &entry.control {
                Some(control) => {
                    control.cancel.cancel();
                    (true, None)
                }
                None => {
                    let partial = entry.job.partial_path.clone();
                    self.transition_locked(&mut state, id, JobState::Cancelled, |job| {
                        job.error = Some(JobError::cancelled());
                    })?;
                    (false, partial)
                }
            }
        };

        if let Some(path) = partial {
            remove_partial(path).await;
        }
        if signalled {
            info!("Cancelling active job {}", id);
            self.wait_for_terminal(id).await
        } else {
            self.bump();
            Ok(JobState::Cancelled)
        }
    }

    /// Cancel every non-terminal member of a batch and stop its expansion.
    /// Returns how many jobs ended up cancelled.
    pub async fn cancel_batch(&self, batch_id: BatchId) -> Result<usize> {
        let (signalled, partials, mut cancelled) = {
            let mut state = self.state.lock();
            let entry = state
                .batches
                .get_mut(&batch_id)
                .ok_or_else(|| EngineError::unknown_batch(batch_id))?;
            entry.expansion.cancel();

            let previous = entry.batch.status.clone();
            let members = entry.batch.job_ids.clone();
            let job_count = members.len();
            if matches!(previous, BatchStatus::Expanding | BatchStatus::Ready) {
                entry.batch.status = BatchStatus::Cancelled;
                self.events.publish(QueueEvent::BatchChanged {
                    batch_id,
                    status: BatchStatus::Cancelled,
                    job_count,
                });
            }

            let mut signalled = Vec::new();
            let mut partials = Vec::new();
            let mut cancelled = 0;
            for id in members {
                let Some(entry) = state.jobs.get(&id) else { continue };
                if entry.job.state.is_terminal() {
                    continue;
                }
                match &entry.control {
                    Some(control) => {
                        control.cancel.cancel();
                        signalled.push(id);
                    }
                    None => {
                        partials.extend(entry.job.partial_path.clone());
                        self.transition_locked(&mut state, id, JobState::Cancelled, |job| {
                            job.error = Some(JobError::cancelled());
                        })?;
                        cancelled += 1;
                    }
                }
            }

            let acted = cancelled > 0 || !signalled.is_empty();
            if !acted && !matches!(previous, BatchStatus::Expanding | BatchStatus::Cancelled) {
                return Err(EngineError::unknown_batch(batch_id));
            }
            (signalled, partials, cancelled)
        };
        self.bump();

        for path in partials {
            remove_partial(path).await;
        }
        for id in signalled {
            if self.wait_for_terminal(id).await? == JobState::Cancelled {
                cancelled += 1;
            }
        }
        info!("Cancelled {} jobs of batch {}", cancelled, batch_id);
        Ok(cancelled)
    }

    /// Pause a queued or downloading job.
    pub async fn pause(&self, id: JobId) -> Result<ResumeMode> {
        {
            let mut state = self.state.lock();
            let entry = state.jobs.get_mut(&id).ok_or_else(|| EngineError::unknown_job(id))?;
            match entry.job.state {
                s if s.is_terminal() => return Err(EngineError::unknown_job(id)),
                JobState::Paused => {
                    let mode = entry.paused.as_ref().map_or(ResumeMode::Restart, |p| p.mode);
                    // a resume that has not been dispatched yet is withdrawn
                    if let Some(info) = entry.paused.as_mut().filter(|p| p.resume_requested) {
                        info.resume_requested = false;
                        let job = entry.job.clone();
                        state.pending.retain(|p| *p != id);
                        self.events.publish(QueueEvent::JobUpdated { job: Box::new(job) });
                        drop(state);
                        self.bump();
                    }
                    return Ok(mode);
                }
                JobState::Queued => {
                    self.transition_locked(&mut state, id, JobState::Paused, |_| {})?;
                    if let Some(entry) = state.jobs.get_mut(&id) {
                        entry.paused = Some(PauseInfo {
                            from: JobState::Queued,
                            mode: ResumeMode::Restart,
                            resume_requested: false,
                        });
                    }
                    drop(state);
                    self.bump();
                    return Ok(ResumeMode::Restart);
                }
                JobState::Downloading => match &entry.control {
                    Some(control) => control.pause.cancel(),
                    None => return Err(EngineError::unknown_job(id)),
                },
                other => {
                    return Err(EngineError::InvalidTransition {
                        job: id,
                        from: other,
                        to: JobState::Paused,
                    })
                }
            }
        }

        let settled = self
            .wait_for(id, |job| job.state != JobState::Downloading)
            .await?;
        let state = self.state.lock();
        match settled.state {
            JobState::Paused => Ok(state
                .jobs
                .get(&id)
                .and_then(|e| e.paused.as_ref())
                .map_or(ResumeMode::Restart, |p| p.mode)),
            s if s.is_terminal() => Err(EngineError::unknown_job(id)),
            other => Err(EngineError::InvalidTransition {
                job: id,
                from: other,
                to: JobState::Paused,
            }),
        }
    }

    /// Resume a paused job. A job paused while queued returns to its place in
    /// the queue; a paused download goes to the back of the queue.
    pub fn resume(&self, id: JobId) -> Result<ResumeMode> {
        let mut state = self.state.lock();
        let entry = state.jobs.get_mut(&id).ok_or_else(|| EngineError::unknown_job(id))?;
        match entry.job.state {
            JobState::Paused => {}
            s if s.is_terminal() => return Err(EngineError::unknown_job(id)),
            other => {
                return Err(EngineError::InvalidTransition {
                    job: id,
                    from: other,
                    to: JobState::Downloading,
                })
            }
        }

        let info = entry.paused.clone().unwrap_or(PauseInfo {
            from: JobState::Queued,
            mode: ResumeMode::Restart,
            resume_requested: false,
        });

        let mode = if info.from == JobState::Queued {
            self.transition_locked(&mut state, id, JobState::Queued, |_| {})?;
            if let Some(entry) = state.jobs.get_mut(&id) {
                entry.paused = None;
            }
            if !state.pending.contains(&id) {
                state.pending.push_back(id);
            }
            ResumeMode::Restart
        } else {
            if !info.resume_requested {
                entry.paused = Some(PauseInfo {
                    resume_requested: true,
                    ..info.clone()
                });
                state.pending.push_back(id);
                let job = state.jobs.get(&id).map(|e| e.job.clone());
                if let Some(job) = job {
                    self.events.publish(QueueEvent::JobUpdated { job: Box::new(job) });
                }
            }
            info.mode
        };
        drop(state);

        self.bump();
        self.dispatch.notify_one();
        Ok(mode)
    }

    /// Move a queued job to `position` in the pending order. Returns `false`
    /// when the job was already dispatched.
    pub fn reorder(&self, id: JobId, position: usize) -> Result<bool> {
        let mut state = self.state.lock();
        let job_state = state
            .jobs
            .get(&id)
            .map(|e| e.job.state)
            .ok_or_else(|| EngineError::unknown_job(id))?;
        if job_state.is_terminal() {
            return Err(EngineError::unknown_job(id));
        }
        if job_state != JobState::Queued {
            debug!("Reorder of {} ignored, job is {}", id, job_state);
            return Ok(false);
        }
        let Some(current) = state.pending.iter().position(|p| *p == id) else {
            return Ok(false);
        };
        state.pending.remove(current);
        let position = position.min(state.pending.len());
        state.pending.insert(position, id);
        self.events.publish(QueueEvent::Reordered { job_id: id, position });
        drop(state);

        self.bump();
        Ok(true)
    }

    /// Drop terminal jobs from memory. History is untouched.
    pub fn purge_terminal(&self) -> usize {
        let mut state = self.state.lock();
        let removed: Vec<JobId> = state
            .order
            .iter()
            .copied()
            .filter(|id| state.jobs.get(id).is_some_and(|e| e.job.state.is_terminal()))
            .collect();
        for id in &removed {
            state.jobs.remove(id);
            self.events.publish(QueueEvent::JobRemoved { job_id: *id });
        }

        let QueueState {
            jobs,
            order,
            batches,
            batch_order,
            ..
        } = &mut *state;
        order.retain(|id| jobs.contains_key(id));
        for entry in batches.values_mut() {
            entry.batch.job_ids.retain(|id| jobs.contains_key(id));
        }
        batches.retain(|_, e| !e.batch.job_ids.is_empty() || e.batch.status.is_expanding());
        batch_order.retain(|id| batches.contains_key(id));
        drop(state);

        if !removed.is_empty() {
            self.bump();
        }
        removed.len()
    }

    /// Stop accepting work: cancel expansions, queued and paused jobs.
    /// Returns the controls of jobs still owned by executors.
    pub async fn close(&self) -> Vec<(JobId, JobControl)> {
        let (active, partials) = {
            let mut state = self.state.lock();
            state.accepting = false;
            for entry in state.batches.values() {
                entry.expansion.cancel();
            }

            let waiting: Vec<JobId> = state
                .order
                .iter()
                .copied()
                .filter(|id| {
                    state.jobs.get(id).is_some_and(|e| {
                        e.control.is_none() && !e.job.state.is_terminal()
                    })
                })
                .collect();
            let mut partials = Vec::new();
            for id in waiting {
                if let Some(entry) = state.jobs.get(&id) {
                    partials.extend(entry.job.partial_path.clone());
                }
                // the job is known to be non-terminal and idle
                let _ = self.transition_locked(&mut state, id, JobState::Cancelled, |job| {
                    job.error = Some(JobError::cancelled());
                });
            }
            state.pending.clear();

            let expanding: Vec<BatchId> = state
                .batches
                .iter()
                .filter(|(_, e)| e.batch.status.is_expanding())
                .map(|(id, _)| *id)
                .collect();
            for batch_id in expanding {
                if let Some(entry) = state.batches.get_mut(&batch_id) {
                    entry.batch.status = BatchStatus::Cancelled;
                    self.events.publish(QueueEvent::BatchChanged {
                        batch_id,
                        status: BatchStatus::Cancelled,
                        job_count: entry.batch.job_ids.len(),
                    });
                }
            }

            let active: Vec<(JobId, JobControl)> = state
                .jobs
                .iter()
                .filter_map(|(id, e)| e.control.clone().map(|c| (*id, c)))
                .collect();
            (active, partials)
        };
        self.bump();

        for path in partials {
            remove_partial(path).await;
        }
        active
    }

    /// Subscriptions end once everything already published was delivered.
    pub fn close_events(&self) {
        self.events.close();
    }

    /// Wait until no executor owns a job.
    pub async fn wait_idle(&self) {
        let mut rx = self.revision.subscribe();
        loop {
            let idle = {
                let state = self.state.lock();
                state.jobs.values().all(|e| e.control.is_none())
            };
            if idle || rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Wait until a batch finished expanding and all its members are terminal.
    pub async fn wait_for_batch(&self, batch_id: BatchId) -> Result<BatchProgress> {
        let mut rx = self.revision.subscribe();
        loop {
            let progress = self
                .batch_progress(batch_id)
                .ok_or_else(|| EngineError::unknown_batch(batch_id))?;
            if progress.is_finished() {
                return Ok(progress);
            }
            if rx.changed().await.is_err() {
                return Ok(progress);
            }
        }
    }

    /// Wait until `done` holds for the job, returning the job at that point.
    pub async fn wait_for(&self, id: JobId, done: impl Fn(&Job) -> bool) -> Result<Job> {
        let mut rx = self.revision.subscribe();
        loop {
            let job = self.job(id).ok_or_else(|| EngineError::unknown_job(id))?;
            if done(&job) || job.state.is_terminal() || rx.changed().await.is_err() {
                return Ok(job);
            }
        }
    }

    async fn wait_for_terminal(&self, id: JobId) -> Result<JobState> {
        Ok(self.wait_for(id, |job| job.state.is_terminal()).await?.state)
    }

    // ----- internals -----

    fn transition_locked(
        &self,
        state: &mut QueueState,
        id: JobId,
        to: JobState,
        apply: impl FnOnce(&mut Job),
    ) -> Result<Job> {
        let entry = state.jobs.get_mut(&id).ok_or_else(|| EngineError::unknown_job(id))?;
        let from = entry.job.state;
        if from.is_terminal() {
            return Err(EngineError::unknown_job(id));
        }
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition { job: id, from, to });
        }

        apply(&mut entry.job);
        entry.job.state = to;
        if to.is_terminal() {
            entry.job.finished_at = Some(Utc::now());
            entry.control = None;
            entry.paused = None;
        } else if to == JobState::Paused || to == JobState::Queued {
            entry.control = None;
        }
        let job = entry.job.clone();

        if to.is_terminal() {
            state.pending.retain(|p| *p != id);
            self.history.append(HistoryRecord::from_job(&job));
            info!("Job {} finished as {}", id, to);
        }
        self.publish_state(&job, from);
        Ok(job)
    }

    fn publish_state(&self, job: &Job, from: JobState) {
        self.events.publish(QueueEvent::StateChanged {
            job_id: job.id,
            batch_id: job.batch_id,
            from,
            to: job.state,
            error: job.error.clone(),
        });
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r = r.wrapping_add(1));
    }
}

async fn remove_partial(path: PathBuf) {
    match tokio::fs::remove_file(&path).await {
        Ok(()) => debug!("Removed partial file {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove partial file {:?}: {}", path, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchKind;
    use crate::job::JobRequest;
    use crate::quality::FormatSelection;
    use std::time::Duration;

    fn queue() -> QueueManager {
        QueueManager::new(64, Arc::new(HistoryStore::in_memory()))
    }

    fn request() -> JobRequest {
        JobRequest {
            download_type: Default::default(),
            selection: FormatSelection::default(),
            trim: None,
            audio_codec: Default::default(),
            output_dir: PathBuf::from("/tmp/out"),
            output_template: "{title}.{ext}".into(),
        }
    }

    fn batch_with_jobs(queue: &QueueManager, n: usize) -> (BatchId, Vec<JobId>) {
        let batch = Batch::new(BatchKind::UrlList, "list");
        let batch_id = batch.id;
        queue.open_batch(batch).unwrap();
        let jobs = (0..n)
            .map(|i| Job::new(batch_id, format!("https://a.example/{i}"), &request()))
            .collect();
        (batch_id, queue.add_jobs(jobs).unwrap())
    }

    #[test]
    fn dispatch_is_fifo() {
        let queue = queue();
        let (_, ids) = batch_with_jobs(&queue, 3);
        let first = queue.next_dispatch().unwrap();
        let second = queue.next_dispatch().unwrap();
        assert_eq!(first.job.id, ids[0]);
        assert_eq!(second.job.id, ids[1]);
        assert_eq!(first.job.state, JobState::Resolving);
        assert_eq!(queue.active_count(), 2);
    }

    #[test]
    fn reorder_to_front_dispatches_next() {
        let queue = queue();
        let (_, ids) = batch_with_jobs(&queue, 3);
        assert!(queue.reorder(ids[2], 0).unwrap());
        assert_eq!(queue.next_dispatch().unwrap().job.id, ids[2]);

        // already dispatched: no-op
        assert!(!queue.reorder(ids[2], 1).unwrap());
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let queue = queue();
        let (_, ids) = batch_with_jobs(&queue, 1);
        let err = queue.transition(ids[0], JobState::Completed, |_| {}).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { from: JobState::Queued, .. }));
    }

    #[tokio::test]
    async fn cancelling_queued_job_twice_is_a_noop() {
        let queue = queue();
        let (_, ids) = batch_with_jobs(&queue, 2);
        assert_eq!(queue.cancel_job(ids[0]).await.unwrap(), JobState::Cancelled);
        assert_eq!(queue.cancel_job(ids[0]).await.unwrap(), JobState::Cancelled);
        assert_eq!(queue.next_dispatch().unwrap().job.id, ids[1]);
        assert_eq!(queue.history().len(), 1);
    }

    #[tokio::test]
    async fn cancel_of_finished_or_unknown_job_is_an_error() {
        let queue = queue();
        let (_, ids) = batch_with_jobs(&queue, 1);
        let ticket = queue.next_dispatch().unwrap();
        queue.transition(ticket.job.id, JobState::Failed, |_| {}).unwrap();

        assert!(matches!(
            queue.cancel_job(ids[0]).await,
            Err(EngineError::NotFoundOrTerminal(_))
        ));
        assert!(matches!(
            queue.cancel_job(JobId::new()).await,
            Err(EngineError::NotFoundOrTerminal(_))
        ));
    }

    #[tokio::test]
    async fn cancelling_active_job_waits_for_executor() {
        let queue = Arc::new(queue());
        let (_, ids) = batch_with_jobs(&queue, 1);
        let ticket = queue.next_dispatch().unwrap();

        let executor = {
            let queue = queue.clone();
            tokio::spawn(async move {
                ticket.control.cancel.cancelled().await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                queue
                    .transition(ticket.job.id, JobState::Cancelled, |_| {})
                    .unwrap();
            })
        };

        assert_eq!(queue.cancel_job(ids[0]).await.unwrap(), JobState::Cancelled);
        executor.await.unwrap();
    }

    #[tokio::test]
    async fn queued_pause_and_resume_keep_position() {
        let queue = queue();
        let (_, ids) = batch_with_jobs(&queue, 3);
        assert_eq!(queue.pause(ids[0]).await.unwrap(), ResumeMode::Restart);
        assert_eq!(queue.job(ids[0]).unwrap().state, JobState::Paused);

        assert_eq!(queue.next_dispatch().unwrap().job.id, ids[1]);
        queue.resume(ids[0]).unwrap();
        assert_eq!(queue.next_dispatch().unwrap().job.id, ids[0]);
    }

    #[tokio::test]
    async fn pause_is_rejected_while_resolving() {
        let queue = queue();
        let (_, ids) = batch_with_jobs(&queue, 1);
        queue.next_dispatch().unwrap();
        assert!(matches!(
            queue.pause(ids[0]).await,
            Err(EngineError::InvalidTransition { from: JobState::Resolving, .. })
        ));
    }

    #[tokio::test]
    async fn paused_download_resumes_from_the_back_of_the_queue() {
        let queue = Arc::new(queue());
        let (_, ids) = batch_with_jobs(&queue, 2);
        let ticket = queue.next_dispatch().unwrap();
        queue.transition(ids[0], JobState::Downloading, |_| {}).unwrap();

        let executor = {
            let queue = queue.clone();
            tokio::spawn(async move {
                ticket.control.pause.cancelled().await;
                queue
                    .mark_paused(ticket.job.id, ResumeMode::Continue { offset: 42 })
                    .unwrap();
            })
        };
        assert_eq!(
            queue.pause(ids[0]).await.unwrap(),
            ResumeMode::Continue { offset: 42 }
        );
        executor.await.unwrap();

        assert_eq!(queue.resume(ids[0]).unwrap(), ResumeMode::Continue { offset: 42 });
        assert_eq!(queue.pending_order(), vec![ids[1], ids[0]]);

        queue.next_dispatch().unwrap();
        let resumed = queue.next_dispatch().unwrap();
        assert_eq!(resumed.job.id, ids[0]);
        assert_eq!(resumed.job.state, JobState::Downloading);
        assert_eq!(resumed.resume, Some(ResumeMode::Continue { offset: 42 }));
    }

    #[tokio::test]
    async fn pausing_again_withdraws_a_pending_resume() {
        let queue = Arc::new(queue());
        let (_, ids) = batch_with_jobs(&queue, 1);
        let ticket = queue.next_dispatch().unwrap();
        queue.transition(ids[0], JobState::Downloading, |_| {}).unwrap();

        let executor = {
            let queue = queue.clone();
            tokio::spawn(async move {
                ticket.control.pause.cancelled().await;
                queue.mark_paused(ticket.job.id, ResumeMode::Restart).unwrap();
            })
        };
        assert_eq!(queue.pause(ids[0]).await.unwrap(), ResumeMode::Restart);
        executor.await.unwrap();

        queue.resume(ids[0]).unwrap();
        assert_eq!(queue.pause(ids[0]).await.unwrap(), ResumeMode::Restart);
        assert!(queue.next_dispatch().is_none());
        assert_eq!(queue.job(ids[0]).unwrap().state, JobState::Paused);

        queue.resume(ids[0]).unwrap();
        let resumed = queue.next_dispatch().unwrap();
        assert_eq!(resumed.job.state, JobState::Downloading);
    }

    #[test]
    fn late_pause_does_not_outlive_the_download_stage() {
        let queue = queue();
        let (_, ids) = batch_with_jobs(&queue, 1);
        let ticket = queue.next_dispatch().unwrap();
        queue.transition(ids[0], JobState::Downloading, |_| {}).unwrap();
        assert!(queue.renew_pause(ids[0]).is_none());

        // the pause lands as the stream ends
        ticket.control.pause.cancel();
        queue.transition(ids[0], JobState::PostProcessing, |_| {}).unwrap();

        let fresh = queue.renew_pause(ids[0]).unwrap();
        assert!(!fresh.is_cancelled());
        queue.transition(ids[0], JobState::Downloading, |_| {}).unwrap();
        assert!(!fresh.is_cancelled());
    }

    #[tokio::test]
    async fn observers_see_every_transition_in_order() {
        let queue = queue();
        let mut sub = queue.subscribe();
        let (_, ids) = batch_with_jobs(&queue, 1);
        queue.next_dispatch().unwrap();
        queue.transition(ids[0], JobState::Downloading, |_| {}).unwrap();
        queue.transition(ids[0], JobState::Completed, |_| {}).unwrap();

        let mut states = Vec::new();
        while let Some(event) = sub.try_recv() {
            if let QueueEvent::StateChanged { from, to, .. } = event {
                states.push((from, to));
            }
        }
        assert_eq!(
            states,
            vec![
                (JobState::Queued, JobState::Resolving),
                (JobState::Resolving, JobState::Downloading),
                (JobState::Downloading, JobState::Completed),
            ]
        );
    }

    #[tokio::test]
    async fn cancelled_batch_rejects_new_members() {
        let queue = queue();
        let batch = Batch::new(BatchKind::Playlist, "pl");
        let batch_id = batch.id;
        let expansion = queue.open_batch(batch).unwrap();

        assert_eq!(queue.cancel_batch(batch_id).await.unwrap(), 0);
        assert!(expansion.is_cancelled());
        assert!(queue
            .add_job(Job::new(batch_id, "https://a.example/1", &request()))
            .is_err());
        assert_eq!(queue.batch(batch_id).unwrap().status, BatchStatus::Cancelled);
    }

    #[test]
    fn purge_keeps_history_and_live_jobs() {
        let queue = queue();
        let (batch_id, ids) = batch_with_jobs(&queue, 2);
        queue.next_dispatch().unwrap();
        queue.transition(ids[0], JobState::Failed, |_| {}).unwrap();

        assert_eq!(queue.purge_terminal(), 1);
        let snapshot = queue.snapshot();
        assert_eq!(snapshot.jobs.len(), 1);
        assert_eq!(snapshot.jobs[0].id, ids[1]);
        assert_eq!(queue.batch(batch_id).unwrap().job_ids, vec![ids[1]]);
        assert_eq!(queue.history().len(), 1);
    }

    #[tokio::test]
    async fn close_cancels_waiting_work_and_reports_active() {
        let queue = queue();
        let (_, ids) = batch_with_jobs(&queue, 3);
        queue.next_dispatch().unwrap();

        let active = queue.close().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].0, ids[0]);
        assert_eq!(queue.job(ids[1]).unwrap().state, JobState::Cancelled);
        assert!(queue.next_dispatch().is_none());
        assert!(matches!(
            queue.add_jobs(Vec::new()),
            Err(EngineError::EngineStopped)
        ));
    }
}
