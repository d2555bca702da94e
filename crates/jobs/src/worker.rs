//! Async worker pool and repeatable-job scheduler.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::handler::{JobContext, JobResult};
use crate::queue::JobQueue;
use crate::schedule::{self, RepeatableSchedule};
use crate::store::JobStore;
use crate::types::Job;

/// Handle for controlling a running worker.
///
/// Dropping the handle without calling [`shutdown`] leaves the loops
/// running until the runtime stops.
///
/// [`shutdown`]: WorkerHandle::shutdown
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Signal shutdown and wait for in-flight handlers to drain.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        for join in self.joins.drain(..) {
            let _ = join.await;
        }
    }
}

/// Background worker: claims jobs in batches of up to `concurrency` and
/// dispatches them to registered handlers; a sibling loop turns due
/// repeatable schedules into job instances.
pub struct Worker {
    queue: Arc<JobQueue>,
}

impl Worker {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self { queue }
    }

    /// Spawn the worker and scheduler loops.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let queue = self.queue.clone();
        let mut rx = shutdown_rx.clone();
        let worker_join = tokio::spawn(async move {
            run_worker_loop(queue, &mut rx).await;
        });

        let queue = self.queue;
        let mut rx = shutdown_rx;
        let scheduler_join = tokio::spawn(async move {
            run_scheduler_loop(queue, &mut rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            joins: vec![worker_join, scheduler_join],
        }
    }
}

async fn run_worker_loop(queue: Arc<JobQueue>, shutdown_rx: &mut watch::Receiver<bool>) {
    let config = queue.config().clone();
    let store = queue.store();
    let poll_interval = Duration::from_millis(config.poll_interval_ms);

    info!(
        concurrency = config.concurrency,
        poll_interval_ms = config.poll_interval_ms,
        "job worker started"
    );

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // Claim up to `concurrency` ready jobs and run them as a batch.
        let mut tasks = JoinSet::new();
        let mut claimed = 0;

        for _ in 0..config.concurrency {
            match store.claim_next().await {
                Ok(Some(job)) => {
                    claimed += 1;
                    let queue = queue.clone();
                    tasks.spawn(async move {
                        execute_job(&queue, job).await;
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    // Infrastructure failure, not a job failure; nothing to retry.
                    error!(error = %e, "worker error: failed to claim job");
                    break;
                }
            }
        }

        if claimed == 0 {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = sleep(poll_interval) => {}
            }
        } else {
            debug!(claimed, "processing job batch");
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!(error = ?e, "job task panicked");
                }
            }
        }
    }

    info!("job worker stopped");
}

async fn execute_job(queue: &JobQueue, mut job: Job) {
    let store = queue.store();
    let retention = queue.config().retention;

    let Some(handler) = queue.handler_for(job.kind.type_name()) else {
        // Configuration error, not transient: drop without retry.
        warn!(job_id = %job.id, kind = %job.kind, "no handler registered, dropping job");
        job.mark_dropped(format!("no handler registered for {}", job.kind));
        if let Err(e) = store.update(&job).await {
            error!(job_id = %job.id, error = %e, "failed to persist dropped job");
        }
        let _ = store.prune(retention).await;
        return;
    };

    let started = Utc::now();
    debug!(job_id = %job.id, kind = %job.kind, attempt = job.attempt, "executing job");

    match handler.execute(JobContext::new(job.clone())).await {
        JobResult::Success => {
            job.mark_completed(started);
            debug!(job_id = %job.id, kind = %job.kind, "job completed");
        }
        JobResult::Failure(error) => {
            warn!(job_id = %job.id, kind = %job.kind, error = %error, "job attempt failed");
            job.mark_failed(error, started);
        }
        JobResult::RetryAfter(error, delay) => {
            warn!(job_id = %job.id, kind = %job.kind, error = %error, "job attempt failed");
            job.mark_failed(error, started);
            if !job.status.is_terminal() {
                job.scheduled_at = Some(Utc::now() + crate::types::clamp_delay(delay));
            }
        }
    }

    if let Err(e) = store.update(&job).await {
        error!(job_id = %job.id, error = %e, "failed to persist job state");
    }

    if job.status.is_terminal() {
        if let Err(e) = store.prune(retention).await {
            error!(error = %e, "failed to prune terminal jobs");
        }
    }
}

async fn run_scheduler_loop(queue: Arc<JobQueue>, shutdown_rx: &mut watch::Receiver<bool>) {
    let store = queue.store();
    let poll_interval = Duration::from_millis(queue.config().poll_interval_ms);

    info!("repeatable-job scheduler started");

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = sleep(poll_interval) => {}
        }
        if *shutdown_rx.borrow() {
            break;
        }

        let now = Utc::now();
        match store.due_schedules(now).await {
            Ok(due) => {
                for schedule in due {
                    fire_schedule(store.as_ref(), schedule).await;
                }
            }
            Err(e) => {
                error!(error = %e, "worker error: failed to scan schedules");
            }
        }
    }

    info!("repeatable-job scheduler stopped");
}

async fn fire_schedule(store: &dyn JobStore, sched: RepeatableSchedule) {
    let job = Job::new(sched.kind.clone(), sched.payload.clone());
    if let Err(e) = store.enqueue(job).await {
        error!(schedule = %sched.id, kind = %sched.kind, error = %e, "failed to enqueue scheduled job");
        return;
    }
    debug!(schedule = %sched.id, kind = %sched.kind, "repeatable job tick enqueued");

    let now = Utc::now();
    let next = schedule::parse_timezone(&sched.timezone)
        .and_then(|tz| schedule::next_fire_after(&sched.pattern, tz, now));

    let next_fire_at = match next {
        Ok(Some(at)) => at,
        Ok(None) => {
            warn!(schedule = %sched.id, pattern = %sched.pattern, "no further fire times; parking schedule");
            now + chrono::Duration::days(365)
        }
        Err(e) => {
            // Validated at registration, so this only happens if the stored
            // pattern was corrupted; park it instead of hot-looping.
            error!(schedule = %sched.id, error = %e, "stored schedule no longer evaluates");
            now + chrono::Duration::days(1)
        }
    };

    if let Err(e) = store.reschedule(sched.id, next_fire_at).await {
        error!(schedule = %sched.id, error = %e, "failed to advance schedule");
    }
}
