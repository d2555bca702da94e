//! Infrastructure wiring: storage, job queue, lock store, realtime channel.

use std::sync::Arc;

use mandi_core::storage::{InMemoryStorage, Storage};
use mandi_jobs::{
    DigestConfig, InMemoryJobStore, InMemoryLockStore, JobLock, JobQueue, LockStore,
    LowStockDigestJob, QueueConfig, register_low_stock_digest,
};
use mandi_realtime::{RealtimeChannel, RealtimeConfig};

/// Everything the route handlers need, shared behind one `Arc`.
pub struct AppServices {
    pub storage: Arc<InMemoryStorage>,
    pub queue: Arc<JobQueue>,
    pub realtime: RealtimeChannel,
}

/// Build the service graph with the in-memory backends and register the
/// low-stock digest (handler, daily schedule, startup run).
pub async fn build_services() -> anyhow::Result<AppServices> {
    let storage = Arc::new(InMemoryStorage::new());

    let queue = Arc::new(JobQueue::new(
        Arc::new(InMemoryJobStore::new()),
        QueueConfig::from_env(),
    ));

    let lock = JobLock::new(build_lock_store()?);

    let digest = LowStockDigestJob::new(
        storage.clone() as Arc<dyn Storage>,
        lock,
        DigestConfig::from_env(),
    );
    register_low_stock_digest(&queue, digest).await?;

    let realtime = RealtimeChannel::new(RealtimeConfig::from_env());

    Ok(AppServices {
        storage,
        queue,
        realtime,
    })
}

/// Redis-backed lock when compiled with the `redis` feature and
/// `REDIS_URL` is set; in-memory otherwise.
fn build_lock_store() -> anyhow::Result<Arc<dyn LockStore>> {
    #[cfg(feature = "redis")]
    if let Ok(url) = std::env::var("REDIS_URL") {
        let store = mandi_jobs::RedisLockStore::new(&url)?;
        tracing::info!("job locks backed by redis");
        return Ok(Arc::new(store));
    }

    Ok(Arc::new(InMemoryLockStore::new()))
}
