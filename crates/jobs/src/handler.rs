//! Job handler trait and dispatch types.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::time::Duration;

use crate::types::{Job, JobKind};

/// Context handed to a handler for one attempt.
pub struct JobContext {
    /// The job being processed.
    pub job: Job,
}

impl JobContext {
    pub fn new(job: Job) -> Self {
        Self { job }
    }

    /// The job payload.
    pub fn payload(&self) -> &JsonValue {
        &self.job.payload
    }

    /// Attempt number for this execution (1-indexed).
    pub fn attempt(&self) -> u32 {
        self.job.attempt
    }
}

/// Result of one handler execution.
///
/// Handlers never mutate job state; the queue turns this into the
/// completed/failed transition and applies the retry policy.
#[derive(Debug)]
pub enum JobResult {
    /// Attempt succeeded.
    Success,
    /// Attempt failed; the retry policy decides what happens next.
    Failure(String),
    /// Attempt failed but the handler knows a better retry delay.
    RetryAfter(String, Duration),
}

/// Trait for job handlers.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job kind this handler processes.
    fn kind(&self) -> JobKind;

    /// Execute one attempt.
    async fn execute(&self, ctx: JobContext) -> JobResult;
}

/// No-op handler for tests.
pub struct NoOpHandler {
    kind: JobKind,
}

impl NoOpHandler {
    pub fn new(kind: JobKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl JobHandler for NoOpHandler {
    fn kind(&self) -> JobKind {
        self.kind.clone()
    }

    async fn execute(&self, _ctx: JobContext) -> JobResult {
        JobResult::Success
    }
}
