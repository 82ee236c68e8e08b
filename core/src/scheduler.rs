use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{ErrorKind, JobError};
use crate::executor::{ExecutorContext, JobExecutor};
use crate::job::{JobId, JobState};

/// Fixed pool of executor slots fed from the queue in FIFO order.
pub struct Scheduler {
    ctx: ExecutorContext,
    slots: Arc<Semaphore>,
    max_concurrent: usize,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(ctx: ExecutorContext) -> Self {
        let max_concurrent = ctx.config.max_concurrent.max(1);
        Self {
            ctx,
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that ends the dispatch loop once cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        info!("Scheduler started with {} slots", self.max_concurrent);
        let mut running: JoinSet<()> = JoinSet::new();

        loop {
            self.fill_slots(&mut running);

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.ctx.queue.dispatch_signal().notified() => {}
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = joined {
                        error!("Executor task ended abnormally: {}", e);
                    }
                }
            }
        }

        // executors finish on their own; the engine decided whether to cancel them
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!("Executor task ended abnormally: {}", e);
            }
        }
        info!("Scheduler stopped");
    }

    /// Dispatch pending jobs while slots are free.
    fn fill_slots(&self, running: &mut JoinSet<()>) {
        loop {
            let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                return;
            };
            let Some(ticket) = self.ctx.queue.next_dispatch() else {
                return;
            };

            let job_id = ticket.job.id;
            debug!(
                "Slot taken by job {} ({} free)",
                job_id,
                self.slots.available_permits()
            );
            let executor = JobExecutor::new(self.ctx.clone(), ticket);
            let ctx = self.ctx.clone();
            running.spawn(async move {
                let outcome = AssertUnwindSafe(executor.run()).catch_unwind().await;
                if outcome.is_err() {
                    fail_after_panic(&ctx, job_id);
                }
                drop(permit);
            });
        }
    }
}

fn fail_after_panic(ctx: &ExecutorContext, job_id: JobId) {
    error!("Executor for job {} panicked", job_id);
    let error = JobError::new(ErrorKind::Permanent, "internal error while running the job");
    let job = ctx.queue.job(job_id);
    if job.is_some_and(|job| !job.state.is_terminal() && job.state != JobState::Paused) {
        let _ = ctx.queue.transition(job_id, JobState::Failed, |job| job.error = Some(error));
    }
}
