//! Distributed job lock.
//!
//! A named, TTL-bound mutual-exclusion lock shared by all process replicas.
//! Acquisition is a single atomic acquire-if-absent attempt, never a
//! blocking wait: losers skip the run and let the next tick try again.
//! There is no renewal, so the TTL must comfortably exceed the slowest
//! expected run.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lock backend error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LockError {
    #[error("lock backend error: {0}")]
    Backend(String),
}

/// Backing store for the lock: atomic set-if-absent with expiry, plus a
/// delete-if-owner primitive so a slow holder cannot release a lock it
/// already lost to TTL expiry.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Try to acquire `name` for `token`. Returns `false` when held by a
    /// live token.
    async fn try_acquire(&self, name: &str, token: &str, ttl: Duration)
    -> Result<bool, LockError>;

    /// Release `name` if (and only if) it is held by `token`. Returns
    /// whether anything was released.
    async fn release(&self, name: &str, token: &str) -> Result<bool, LockError>;
}

/// Options for one lock attempt.
#[derive(Debug, Clone)]
pub struct LockOptions {
    pub name: String,
    pub ttl: Duration,
}

impl LockOptions {
    pub fn new(name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            ttl,
        }
    }
}

/// Outcome of a lock-guarded run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome<T> {
    /// The lock was acquired and the guarded function ran.
    Acquired(T),
    /// Another holder had the lock (or the store was unreachable); the
    /// guarded function did not run.
    Skipped,
}

impl<T> LockOutcome<T> {
    pub fn acquired(&self) -> bool {
        matches!(self, LockOutcome::Acquired(_))
    }

    pub fn into_inner(self) -> Option<T> {
        match self {
            LockOutcome::Acquired(value) => Some(value),
            LockOutcome::Skipped => None,
        }
    }
}

/// Distributed job lock over a shared [`LockStore`].
#[derive(Clone)]
pub struct JobLock {
    store: Arc<dyn LockStore>,
}

impl JobLock {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self { store }
    }

    /// Run `f` under the named lock.
    ///
    /// At most one concurrent caller per lock name executes `f`; the rest
    /// get [`LockOutcome::Skipped`] immediately. A store error is treated
    /// as "not acquired" (fail closed) and logged, never surfaced. An error
    /// from `f` itself propagates after a best-effort release.
    pub async fn with_job_lock<T, E, F, Fut>(
        &self,
        opts: &LockOptions,
        f: F,
    ) -> Result<LockOutcome<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let token = Uuid::now_v7().to_string();

        match self.store.try_acquire(&opts.name, &token, opts.ttl).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(lock = %opts.name, "lock held elsewhere, skipping run");
                return Ok(LockOutcome::Skipped);
            }
            Err(e) => {
                warn!(lock = %opts.name, error = %e, "lock store unreachable, failing closed");
                return Ok(LockOutcome::Skipped);
            }
        }

        let result = f().await;

        if let Err(e) = self.store.release(&opts.name, &token).await {
            warn!(lock = %opts.name, error = %e, "failed to release job lock; TTL will expire it");
        }

        result.map(LockOutcome::Acquired)
    }
}

/// In-memory lock store for tests/dev (single-process only).
#[derive(Debug, Default)]
pub struct InMemoryLockStore {
    entries: Mutex<HashMap<String, LockEntry>>,
}

#[derive(Debug)]
struct LockEntry {
    token: String,
    expires_at: Instant,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn try_acquire(
        &self,
        name: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();

        if let Some(entry) = entries.get(name) {
            if entry.expires_at > now {
                return Ok(false);
            }
        }

        entries.insert(
            name.to_string(),
            LockEntry {
                token: token.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, name: &str, token: &str) -> Result<bool, LockError> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(name) {
            Some(entry) if entry.token == token => {
                entries.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Redis-backed lock store (`SET NX PX` + scripted delete-if-owner).
#[cfg(feature = "redis")]
pub struct RedisLockStore {
    client: redis::Client,
    key_prefix: String,
}

#[cfg(feature = "redis")]
impl RedisLockStore {
    const DEFAULT_KEY_PREFIX: &'static str = "mandi:lock:";

    pub fn new(url: &str) -> Result<Self, LockError> {
        let client = redis::Client::open(url).map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(Self {
            client,
            key_prefix: Self::DEFAULT_KEY_PREFIX.to_string(),
        })
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix, name)
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl LockStore for RedisLockStore {
    async fn try_acquire(
        &self,
        name: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        let set: Option<String> = redis::cmd("SET")
            .arg(self.key(name))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        Ok(set.is_some())
    }

    async fn release(&self, name: &str, token: &str) -> Result<bool, LockError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        let script = redis::Script::new(
            r"if redis.call('get', KEYS[1]) == ARGV[1] then
                  return redis.call('del', KEYS[1])
              else
                  return 0
              end",
        );

        let deleted: i64 = script
            .key(self.key(name))
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        Ok(deleted == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Barrier;

    fn lock_over(store: Arc<InMemoryLockStore>) -> JobLock {
        JobLock::new(store)
    }

    #[tokio::test]
    async fn concurrent_callers_run_exactly_once() {
        let store = Arc::new(InMemoryLockStore::new());
        let runs = Arc::new(AtomicU32::new(0));
        let barrier = Arc::new(Barrier::new(2));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let lock = lock_over(store.clone());
            let runs = runs.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                lock.with_job_lock::<_, (), _, _>(
                    &LockOptions::new("digest", Duration::from_secs(10)),
                    || async {
                        runs.fetch_add(1, Ordering::SeqCst);
                        // Hold the lock long enough for the loser to contend.
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(())
                    },
                )
                .await
            }));
        }

        let mut acquired = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().acquired() {
                acquired += 1;
            }
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(acquired, 1);
    }

    #[tokio::test]
    async fn lock_is_released_when_guarded_fn_errors() {
        let store = Arc::new(InMemoryLockStore::new());
        let lock = lock_over(store);
        let opts = LockOptions::new("digest", Duration::from_secs(10));

        let result: Result<LockOutcome<()>, &str> =
            lock.with_job_lock(&opts, || async { Err("boom") }).await;
        assert_eq!(result, Err("boom"));

        // A new acquire succeeds immediately.
        let outcome = lock
            .with_job_lock::<_, (), _, _>(&opts, || async { Ok(42) })
            .await
            .unwrap();
        assert_eq!(outcome, LockOutcome::Acquired(42));
    }

    #[tokio::test]
    async fn ttl_expiry_breaks_a_crashed_holder() {
        let store = InMemoryLockStore::new();

        assert!(
            store
                .try_acquire("digest", "holder-1", Duration::from_millis(30))
                .await
                .unwrap()
        );
        assert!(
            !store
                .try_acquire("digest", "holder-2", Duration::from_millis(30))
                .await
                .unwrap()
        );

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(
            store
                .try_acquire("digest", "holder-2", Duration::from_millis(30))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn release_requires_the_holder_token() {
        let store = InMemoryLockStore::new();

        store
            .try_acquire("digest", "holder-1", Duration::from_secs(10))
            .await
            .unwrap();

        assert!(!store.release("digest", "someone-else").await.unwrap());
        assert!(
            !store
                .try_acquire("digest", "holder-2", Duration::from_secs(10))
                .await
                .unwrap()
        );

        assert!(store.release("digest", "holder-1").await.unwrap());
    }

    struct UnreachableLockStore;

    #[async_trait]
    impl LockStore for UnreachableLockStore {
        async fn try_acquire(&self, _: &str, _: &str, _: Duration) -> Result<bool, LockError> {
            Err(LockError::Backend("connection refused".into()))
        }

        async fn release(&self, _: &str, _: &str) -> Result<bool, LockError> {
            Err(LockError::Backend("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn store_errors_fail_closed() {
        let lock = JobLock::new(Arc::new(UnreachableLockStore));
        let runs = AtomicU32::new(0);

        let outcome = lock
            .with_job_lock::<_, (), _, _>(
                &LockOptions::new("digest", Duration::from_secs(10)),
                || async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome, LockOutcome::Skipped);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
