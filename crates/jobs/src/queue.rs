//! Job queue service.
//!
//! One `JobQueue` is constructed at process startup and passed by reference
//! to anything that enqueues work (route handlers, job registration); there
//! is no global singleton.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::handler::JobHandler;
use crate::schedule::{
    self, DEFAULT_TIMEZONE, RepeatableSchedule, ScheduleError, ScheduleId,
};
use crate::store::{JobStats, JobStore, JobStoreError};
use crate::types::{Job, JobId, JobKind, RetentionPolicy, RetryPolicy};
use crate::{DEFAULT_CONCURRENCY, DEFAULT_POLL_INTERVAL_MS};

/// Queue error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error("pattern {0:?} has no upcoming fire time")]
    NoUpcomingFire(String),
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Max jobs in flight per process.
    pub concurrency: usize,
    /// Polling interval when the queue is empty (also the scheduler tick).
    pub poll_interval_ms: u64,
    /// Default IANA timezone for repeatable jobs.
    pub timezone: String,
    /// Terminal-job retention.
    pub retention: RetentionPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            timezone: DEFAULT_TIMEZONE.to_string(),
            retention: RetentionPolicy::default(),
        }
    }
}

impl QueueConfig {
    /// Build from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `JOB_CONCURRENCY` | `5` |
    /// | `JOB_POLL_INTERVAL_MS` | `500` |
    /// | `CRON_TZ` | `Asia/Kolkata` |
    pub fn from_env() -> Self {
        let concurrency = std::env::var("JOB_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_CONCURRENCY)
            .max(1);

        let poll_interval_ms = std::env::var("JOB_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);

        let timezone =
            std::env::var("CRON_TZ").unwrap_or_else(|_| DEFAULT_TIMEZONE.to_string());

        Self {
            concurrency,
            poll_interval_ms,
            timezone,
            retention: RetentionPolicy::default(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }
}

/// Options for a one-off enqueue.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub delay: Option<Duration>,
    pub priority: i32,
    pub retry_policy: Option<RetryPolicy>,
}

/// Options for a repeatable registration.
#[derive(Debug, Clone, Default)]
pub struct RepeatOptions {
    /// IANA timezone; falls back to the queue default.
    pub timezone: Option<String>,
}

/// The job queue service.
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    config: QueueConfig,
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, config: QueueConfig) -> Self {
        Self {
            store,
            config,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    /// Enqueue a one-off job. Resolves once the job is persisted, not once
    /// it is processed. No uniqueness constraint: duplicate enqueues
    /// produce duplicate jobs.
    pub async fn add_job(
        &self,
        kind: JobKind,
        payload: JsonValue,
        opts: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        let mut job = Job::new(kind, payload).with_priority(opts.priority);
        if let Some(policy) = opts.retry_policy {
            job = job.with_retry_policy(policy);
        }
        if let Some(delay) = opts.delay {
            job = job.delayed(delay);
        }

        let id = self.store.enqueue(job).await?;
        debug!(job_id = %id, "job enqueued");
        Ok(id)
    }

    /// Register a recurring schedule; one job instance is produced per cron
    /// tick. Returns `false` when an identical (kind, pattern) schedule
    /// already exists, so calling this on every process restart is safe.
    pub async fn add_repeatable_job(
        &self,
        kind: JobKind,
        payload: JsonValue,
        pattern: &str,
        opts: RepeatOptions,
    ) -> Result<bool, QueueError> {
        let tz_name = opts
            .timezone
            .unwrap_or_else(|| self.config.timezone.clone());
        let tz = schedule::parse_timezone(&tz_name)?;

        let now = Utc::now();
        let next_fire_at = schedule::next_fire_after(pattern, tz, now)?
            .ok_or_else(|| QueueError::NoUpcomingFire(pattern.to_string()))?;

        let schedule = RepeatableSchedule {
            id: ScheduleId::new(),
            kind: kind.clone(),
            pattern: pattern.to_string(),
            timezone: tz_name,
            payload,
            next_fire_at,
            created_at: now,
        };

        let inserted = self.store.insert_schedule(schedule).await?;
        if inserted {
            debug!(kind = %kind, pattern, next_fire_at = %next_fire_at, "repeatable job registered");
        } else {
            debug!(kind = %kind, pattern, "repeatable job already registered");
        }
        Ok(inserted)
    }

    /// Associate a handler with its job kind. Must happen before the worker
    /// starts processing that kind; jobs without a handler are dropped.
    pub fn register_handler(&self, handler: Arc<dyn JobHandler>) {
        let kind = handler.kind();
        debug!(kind = %kind, "job handler registered");
        self.handlers
            .write()
            .unwrap()
            .insert(kind.type_name().to_string(), handler);
    }

    pub(crate) fn handler_for(&self, type_name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().unwrap().get(type_name).cloned()
    }

    pub async fn stats(&self) -> Result<JobStats, QueueError> {
        Ok(self.store.stats().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryJobStore;
    use crate::types::JobStatus;

    fn queue() -> JobQueue {
        JobQueue::new(Arc::new(InMemoryJobStore::new()), QueueConfig::default())
    }

    #[tokio::test]
    async fn add_job_persists_before_returning() {
        let queue = queue();
        let id = queue
            .add_job(
                JobKind::custom("test"),
                serde_json::json!({"n": 1}),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let job = queue.store().get(id).await.unwrap().unwrap();
        assert!(matches!(job.status, JobStatus::Pending));
        assert_eq!(job.payload, serde_json::json!({"n": 1}));
    }

    #[tokio::test]
    async fn duplicate_enqueues_are_allowed() {
        let queue = queue();
        for _ in 0..2 {
            queue
                .add_job(
                    JobKind::custom("dup"),
                    serde_json::json!({}),
                    EnqueueOptions::default(),
                )
                .await
                .unwrap();
        }
        assert_eq!(queue.stats().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn repeatable_registration_is_idempotent() {
        let queue = queue();

        let first = queue
            .add_repeatable_job(
                JobKind::LowStockDigest,
                serde_json::json!({}),
                "0 8 * * *",
                RepeatOptions::default(),
            )
            .await
            .unwrap();
        assert!(first);

        let second = queue
            .add_repeatable_job(
                JobKind::LowStockDigest,
                serde_json::json!({}),
                "0 8 * * *",
                RepeatOptions::default(),
            )
            .await
            .unwrap();
        assert!(!second);

        assert_eq!(queue.store().list_schedules().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn repeatable_rejects_bad_pattern_and_timezone() {
        let queue = queue();

        let err = queue
            .add_repeatable_job(
                JobKind::LowStockDigest,
                serde_json::json!({}),
                "nonsense",
                RepeatOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::Schedule(ScheduleError::InvalidPattern { .. })
        ));

        let err = queue
            .add_repeatable_job(
                JobKind::LowStockDigest,
                serde_json::json!({}),
                "0 8 * * *",
                RepeatOptions {
                    timezone: Some("Nowhere/Nothing".to_string()),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::Schedule(ScheduleError::UnknownTimezone(_))
        ));
    }
}
