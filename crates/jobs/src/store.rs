//! Job storage implementations.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::schedule::{RepeatableSchedule, ScheduleId};
use crate::types::{Job, JobId, JobStatus, RetentionPolicy};

/// Job store abstraction.
///
/// Every operation may touch a shared backing store and is therefore
/// async; callers must treat failures as infrastructure errors, not as a
/// verdict on the job itself.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job. Duplicate enqueues produce duplicate jobs.
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Update a job.
    async fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Claim the next ready job (highest priority first, then FIFO) and
    /// mark it running. Returns `None` when nothing is ready.
    async fn claim_next(&self) -> Result<Option<Job>, JobStoreError>;

    /// Drop old terminal jobs beyond the retention policy.
    async fn prune(&self, retention: RetentionPolicy) -> Result<(), JobStoreError>;

    /// Queue statistics.
    async fn stats(&self) -> Result<JobStats, JobStoreError>;

    /// Register a repeatable schedule. Returns `false` (and stores nothing)
    /// when a schedule with the same (kind, pattern) already exists.
    async fn insert_schedule(&self, schedule: RepeatableSchedule) -> Result<bool, JobStoreError>;

    /// Schedules whose `next_fire_at` is at or before `now`.
    async fn due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RepeatableSchedule>, JobStoreError>;

    /// Advance a schedule to its next fire time.
    async fn reschedule(
        &self,
        schedule_id: ScheduleId,
        next_fire_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError>;

    /// All registered schedules.
    async fn list_schedules(&self) -> Result<Vec<RepeatableSchedule>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("schedule not found: {0}")]
    ScheduleNotFound(ScheduleId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Queue statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub exhausted: usize,
    pub schedules: usize,
}

/// In-memory job store for tests/dev.
///
/// Process-local, so it only exercises the single-instance path; a
/// multi-replica deployment points this trait at a durable shared store.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
    schedules: Mutex<Vec<RepeatableSchedule>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs.get(&job_id).cloned())
    }

    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        if !jobs.contains_key(&job.id) {
            return Err(JobStoreError::NotFound(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn claim_next(&self) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs.lock().unwrap();

        let mut candidates: Vec<_> = jobs
            .values()
            .filter(|j| {
                matches!(j.status, JobStatus::Pending | JobStatus::Failed { .. }) && j.is_ready()
            })
            .map(|j| (j.id, j.priority, j.created_at))
            .collect();

        candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

        if let Some(&(job_id, _, _)) = candidates.first() {
            if let Some(job) = jobs.get_mut(&job_id) {
                job.mark_running();
                return Ok(Some(job.clone()));
            }
        }

        Ok(None)
    }

    async fn prune(&self, retention: RetentionPolicy) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.lock().unwrap();

        prune_status(&mut jobs, retention.keep_completed, |s| {
            matches!(s, JobStatus::Completed)
        });
        prune_status(&mut jobs, retention.keep_failed, |s| {
            matches!(s, JobStatus::Exhausted { .. })
        });

        Ok(())
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.lock().unwrap();
        let schedules = self.schedules.lock().unwrap();

        let mut stats = JobStats {
            schedules: schedules.len(),
            ..Default::default()
        };

        for job in jobs.values() {
            match &job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed { .. } => stats.failed += 1,
                JobStatus::Exhausted { .. } => stats.exhausted += 1,
            }
        }

        Ok(stats)
    }

    async fn insert_schedule(&self, schedule: RepeatableSchedule) -> Result<bool, JobStoreError> {
        let mut schedules = self.schedules.lock().unwrap();
        let key = schedule.dedup_key();
        if schedules.iter().any(|s| s.dedup_key() == key) {
            return Ok(false);
        }
        schedules.push(schedule);
        Ok(true)
    }

    async fn due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RepeatableSchedule>, JobStoreError> {
        let schedules = self.schedules.lock().unwrap();
        Ok(schedules
            .iter()
            .filter(|s| s.next_fire_at <= now)
            .cloned()
            .collect())
    }

    async fn reschedule(
        &self,
        schedule_id: ScheduleId,
        next_fire_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let mut schedules = self.schedules.lock().unwrap();
        let schedule = schedules
            .iter_mut()
            .find(|s| s.id == schedule_id)
            .ok_or(JobStoreError::ScheduleNotFound(schedule_id))?;
        schedule.next_fire_at = next_fire_at;
        Ok(())
    }

    async fn list_schedules(&self) -> Result<Vec<RepeatableSchedule>, JobStoreError> {
        Ok(self.schedules.lock().unwrap().clone())
    }
}

fn prune_status(
    jobs: &mut HashMap<JobId, Job>,
    keep: usize,
    matches: impl Fn(&JobStatus) -> bool,
) {
    let mut terminal: Vec<_> = jobs
        .values()
        .filter(|j| matches(&j.status))
        .map(|j| (j.id, j.updated_at))
        .collect();

    if terminal.len() <= keep {
        return;
    }

    // Newest first; everything past `keep` goes.
    terminal.sort_by(|a, b| b.1.cmp(&a.1));
    for (id, _) in terminal.into_iter().skip(keep) {
        jobs.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobKind;

    #[tokio::test]
    async fn enqueue_and_claim() {
        let store = InMemoryJobStore::new();

        let job = Job::new(JobKind::custom("test"), serde_json::json!({}));
        let job_id = store.enqueue(job).await.unwrap();

        let claimed = store.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, job_id);
        assert!(matches!(claimed.status, JobStatus::Running));
        assert_eq!(claimed.attempt, 1);

        assert!(store.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_respects_priority_then_fifo() {
        let store = InMemoryJobStore::new();

        let low = Job::new(JobKind::custom("low"), serde_json::json!({}));
        let high = Job::new(JobKind::custom("high"), serde_json::json!({})).with_priority(10);
        store.enqueue(low.clone()).await.unwrap();
        store.enqueue(high.clone()).await.unwrap();

        let first = store.claim_next().await.unwrap().unwrap();
        assert_eq!(first.id, high.id);
        let second = store.claim_next().await.unwrap().unwrap();
        assert_eq!(second.id, low.id);
    }

    #[tokio::test]
    async fn delayed_jobs_are_not_ready() {
        let store = InMemoryJobStore::new();

        let job = Job::new(JobKind::custom("later"), serde_json::json!({}))
            .delayed(std::time::Duration::from_secs(60));
        store.enqueue(job).await.unwrap();

        assert!(store.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn prune_keeps_most_recent_terminal_jobs() {
        let store = InMemoryJobStore::new();

        for _ in 0..5 {
            let mut job = Job::new(JobKind::custom("done"), serde_json::json!({}));
            job.mark_running();
            job.mark_completed(Utc::now());
            store.enqueue(job).await.unwrap();
        }

        store
            .prune(RetentionPolicy {
                keep_completed: 2,
                keep_failed: 500,
            })
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.completed, 2);
    }

    #[tokio::test]
    async fn schedule_registration_is_idempotent() {
        let store = InMemoryJobStore::new();

        let schedule = RepeatableSchedule {
            id: ScheduleId::new(),
            kind: JobKind::LowStockDigest,
            pattern: "0 8 * * *".to_string(),
            timezone: "Asia/Kolkata".to_string(),
            payload: serde_json::json!({}),
            next_fire_at: Utc::now(),
            created_at: Utc::now(),
        };

        assert!(store.insert_schedule(schedule.clone()).await.unwrap());

        let duplicate = RepeatableSchedule {
            id: ScheduleId::new(),
            ..schedule
        };
        assert!(!store.insert_schedule(duplicate).await.unwrap());
        assert_eq!(store.list_schedules().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn due_schedules_and_reschedule() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let schedule = RepeatableSchedule {
            id: ScheduleId::new(),
            kind: JobKind::LowStockDigest,
            pattern: "0 8 * * *".to_string(),
            timezone: "UTC".to_string(),
            payload: serde_json::json!({}),
            next_fire_at: now - chrono::Duration::seconds(1),
            created_at: now,
        };
        let id = schedule.id;
        store.insert_schedule(schedule).await.unwrap();

        let due = store.due_schedules(now).await.unwrap();
        assert_eq!(due.len(), 1);

        store
            .reschedule(id, now + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(store.due_schedules(now).await.unwrap().is_empty());
    }
}
