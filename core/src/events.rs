use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::batch::{BatchId, BatchStatus};
use crate::error::JobError;
use crate::job::{Job, JobId, JobProgress, JobState};

/// Everything an observer can learn about the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueueEvent {
    /// A job entered the queue. Carries the initial snapshot.
    JobAdded { job: Box<Job> },
    /// A state transition, delivered exactly once and in order.
    StateChanged {
        job_id: JobId,
        batch_id: BatchId,
        from: JobState,
        to: JobState,
        error: Option<JobError>,
    },
    /// Progress within the current stage. May be coalesced under back-pressure.
    Progress { job_id: JobId, progress: JobProgress },
    /// Metadata or retry bookkeeping changed without a state change.
    JobUpdated { job: Box<Job> },
    /// A queued job moved to a new position in the pending order.
    Reordered { job_id: JobId, position: usize },
    /// Terminal job dropped from the in-memory queue.
    JobRemoved { job_id: JobId },
    BatchChanged {
        batch_id: BatchId,
        status: BatchStatus,
        job_count: usize,
    },
}

impl QueueEvent {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            QueueEvent::JobAdded { job } | QueueEvent::JobUpdated { job } => Some(job.id),
            QueueEvent::StateChanged { job_id, .. }
            | QueueEvent::Progress { job_id, .. }
            | QueueEvent::Reordered { job_id, .. }
            | QueueEvent::JobRemoved { job_id } => Some(*job_id),
            QueueEvent::BatchChanged { .. } => None,
        }
    }

    pub fn is_progress(&self) -> bool {
        matches!(self, QueueEvent::Progress { .. })
    }
}

#[derive(Debug)]
struct Mailbox {
    events: Mutex<VecDeque<QueueEvent>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    dropped_receiver: AtomicBool,
    coalesced: AtomicU64,
}

impl Mailbox {
    /// Never blocks. Over capacity, a progress event replaces the newest pending
    /// progress event of the same job, as long as no other event for that job
    /// sits behind it. Everything else is always queued.
    fn push(&self, event: QueueEvent) {
        {
            let mut events = self.events.lock();
            if events.len() >= self.capacity && event.is_progress() {
                let job_id = event.job_id();
                let slot = events
                    .iter()
                    .rposition(|pending| pending.job_id() == job_id)
                    .filter(|&i| events[i].is_progress());
                if let Some(i) = slot {
                    events[i] = event;
                    self.coalesced.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
            events.push_back(event);
        }
        self.notify.notify_one();
    }
}

/// Fan-out of queue events to every live subscription.
#[derive(Debug)]
pub struct EventBus {
    subscribers: Mutex<Vec<Arc<Mailbox>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let mailbox = Arc::new(Mailbox {
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: self.capacity,
            closed: AtomicBool::new(false),
            dropped_receiver: AtomicBool::new(false),
            coalesced: AtomicU64::new(0),
        });
        self.subscribers.lock().push(mailbox.clone());
        Subscription { mailbox }
    }

    pub fn publish(&self, event: QueueEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|mailbox| !mailbox.dropped_receiver.load(Ordering::Acquire));
        if let Some((last, rest)) = subscribers.split_last() {
            for mailbox in rest {
                mailbox.push(event.clone());
            }
            last.push(event);
        }
    }

    /// Subscriptions drain what is already queued and then end.
    pub fn close(&self) {
        for mailbox in self.subscribers.lock().drain(..) {
            mailbox.closed.store(true, Ordering::Release);
            mailbox.notify.notify_one();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .iter()
            .filter(|m| !m.dropped_receiver.load(Ordering::Acquire))
            .count()
    }
}

/// Receiving end of an observer registration.
#[derive(Debug)]
pub struct Subscription {
    mailbox: Arc<Mailbox>,
}

impl Subscription {
    /// Next event, or `None` once the engine stopped and everything was delivered.
    pub async fn recv(&mut self) -> Option<QueueEvent> {
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.mailbox.closed.load(Ordering::Acquire) {
                return self.try_recv();
            }
            self.mailbox.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<QueueEvent> {
        self.mailbox.events.lock().pop_front()
    }

    pub fn pending(&self) -> usize {
        self.mailbox.events.lock().len()
    }

    /// Progress events replaced by newer ones because this subscriber fell behind.
    pub fn coalesced(&self) -> u64 {
        self.mailbox.coalesced.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.mailbox.dropped_receiver.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Stage;

    fn progress(job_id: JobId, bytes: u64) -> QueueEvent {
        let mut progress = JobProgress::starting(Stage::Download, 1);
        progress.downloaded_bytes = bytes;
        QueueEvent::Progress { job_id, progress }
    }

    fn state(job_id: JobId, from: JobState, to: JobState) -> QueueEvent {
        QueueEvent::StateChanged {
            job_id,
            batch_id: BatchId::new(),
            from,
            to,
            error: None,
        }
    }

    fn bytes_of(event: &QueueEvent) -> u64 {
        match event {
            QueueEvent::Progress { progress, .. } => progress.downloaded_bytes,
            other => panic!("expected progress, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe();
        let id = JobId::new();

        bus.publish(state(id, JobState::Queued, JobState::Resolving));
        bus.publish(state(id, JobState::Resolving, JobState::Downloading));
        bus.publish(progress(id, 10));

        assert!(matches!(
            sub.recv().await,
            Some(QueueEvent::StateChanged { to: JobState::Resolving, .. })
        ));
        assert!(matches!(
            sub.recv().await,
            Some(QueueEvent::StateChanged { to: JobState::Downloading, .. })
        ));
        assert_eq!(bytes_of(&sub.recv().await.unwrap()), 10);
    }

    #[test]
    fn full_queue_coalesces_progress_latest_wins() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();
        let id = JobId::new();

        bus.publish(progress(id, 1));
        bus.publish(progress(id, 2));
        bus.publish(progress(id, 3));
        bus.publish(progress(id, 4));

        assert_eq!(sub.pending(), 2);
        assert_eq!(sub.coalesced(), 2);
        assert_eq!(bytes_of(&sub.try_recv().unwrap()), 1);
        assert_eq!(bytes_of(&sub.try_recv().unwrap()), 4);
    }

    #[test]
    fn state_changes_are_never_dropped() {
        let bus = EventBus::new(1);
        let mut sub = bus.subscribe();
        let id = JobId::new();

        bus.publish(progress(id, 1));
        bus.publish(state(id, JobState::Downloading, JobState::Paused));
        bus.publish(state(id, JobState::Paused, JobState::Downloading));
        bus.publish(progress(id, 2));
        bus.publish(progress(id, 3));

        let events: Vec<_> = std::iter::from_fn(|| sub.try_recv()).collect();
        assert_eq!(events.len(), 4);
        assert_eq!(bytes_of(&events[0]), 1);
        assert!(matches!(events[1], QueueEvent::StateChanged { to: JobState::Paused, .. }));
        assert!(matches!(events[2], QueueEvent::StateChanged { to: JobState::Downloading, .. }));
        assert_eq!(bytes_of(&events[3]), 3);
    }

    #[test]
    fn progress_never_jumps_ahead_of_a_state_change() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();
        let id = JobId::new();

        bus.publish(progress(id, 1));
        bus.publish(state(id, JobState::Downloading, JobState::PostProcessing));
        bus.publish(progress(id, 2));

        let events: Vec<_> = std::iter::from_fn(|| sub.try_recv()).collect();
        assert_eq!(events.len(), 3);
        assert_eq!(bytes_of(&events[2]), 2);
    }

    #[test]
    fn other_jobs_progress_is_not_merged() {
        let bus = EventBus::new(1);
        let mut sub = bus.subscribe();
        let (a, b) = (JobId::new(), JobId::new());

        bus.publish(progress(a, 1));
        bus.publish(progress(b, 7));
        bus.publish(progress(a, 2));

        let events: Vec<_> = std::iter::from_fn(|| sub.try_recv()).collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].job_id(), Some(a));
        assert_eq!(events[1].job_id(), Some(b));
        assert_eq!(bytes_of(&events[1]), 7);
    }

    #[tokio::test]
    async fn close_ends_subscription_after_draining() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe();
        bus.publish(progress(JobId::new(), 5));
        bus.close();

        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn dropped_subscriptions_are_pruned() {
        let bus = EventBus::new(4);
        let sub = bus.subscribe();
        let _other = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        drop(sub);
        bus.publish(progress(JobId::new(), 1));
        assert_eq!(bus.subscriber_count(), 1);
    }
}
