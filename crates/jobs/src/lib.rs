//! `mandi-jobs`: background job queue, distributed job lock and the
//! low-stock digest job.
//!
//! The queue gives at-least-once delivery with exponential-backoff retries;
//! handlers that must not run twice concurrently (across process replicas)
//! wrap themselves in [`JobLock::with_job_lock`].

pub mod digest;
pub mod handler;
pub mod lock;
pub mod queue;
pub mod schedule;
pub mod store;
pub mod types;
pub mod worker;

pub use digest::{DigestConfig, DigestReport, LowStockDigestJob, register_low_stock_digest};
pub use handler::{JobContext, JobHandler, JobResult};
pub use lock::{InMemoryLockStore, JobLock, LockError, LockOptions, LockOutcome, LockStore};
pub use queue::{EnqueueOptions, JobQueue, QueueConfig, QueueError, RepeatOptions};
pub use schedule::{RepeatableSchedule, ScheduleError, ScheduleId, next_fire_after};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{Job, JobId, JobKind, JobStatus, RetentionPolicy, RetryPolicy};
pub use worker::{Worker, WorkerHandle};

#[cfg(feature = "redis")]
pub use lock::RedisLockStore;

/// Default polling interval when the queue is empty.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Default number of jobs in flight per process.
pub const DEFAULT_CONCURRENCY: usize = 5;
