//! Low-stock digest job.
//!
//! Scheduled daily; aggregates low-stock inventory across all shops in one
//! bounded scan and creates one notification per affected shop. The whole
//! run is wrapped in the distributed job lock so that only one process
//! replica executes a given tick.
//!
//! Running the digest twice in the same interval produces duplicate
//! notifications: the lock prevents *concurrent* duplicates, not re-runs
//! across separate ticks (the startup run may land near the first cron
//! tick).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use mandi_core::{LowStockQuery, NewNotification, ShopId, Storage, StorageError, UserId};

use crate::handler::{JobContext, JobHandler, JobResult};
use crate::lock::{JobLock, LockOptions, LockOutcome};
use crate::queue::{EnqueueOptions, JobQueue, QueueError, RepeatOptions};
use crate::schedule::DEFAULT_TIMEZONE;
use crate::types::JobKind;

/// Lock name shared by all replicas running the digest.
pub const LOCK_NAME: &str = "low-stock-digest";

/// Notification kind attached to digest notifications.
pub const NOTIFICATION_KIND: &str = "shop";

const DEFAULT_CRON: &str = "0 8 * * *";
const DEFAULT_LOCK_TTL_MS: u64 = 600_000;
const DEFAULT_SCAN_LIMIT: usize = 1000;

/// Digest configuration.
#[derive(Debug, Clone)]
pub struct DigestConfig {
    /// Cron pattern for the daily run.
    pub cron_pattern: String,
    /// IANA timezone the pattern is evaluated in.
    pub timezone: String,
    /// Lock TTL; must exceed the slowest expected run by a wide margin
    /// since there is no renewal.
    pub lock_ttl: Duration,
    /// Upper bound on the low-stock scan.
    pub scan_limit: usize,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            cron_pattern: DEFAULT_CRON.to_string(),
            timezone: DEFAULT_TIMEZONE.to_string(),
            lock_ttl: Duration::from_millis(DEFAULT_LOCK_TTL_MS),
            scan_limit: DEFAULT_SCAN_LIMIT,
        }
    }
}

impl DigestConfig {
    /// Build from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `LOW_STOCK_DIGEST_CRON` | `0 8 * * *` |
    /// | `CRON_TZ` | `Asia/Kolkata` |
    /// | `LOW_STOCK_DIGEST_LOCK_TTL_MS` (fallback `JOB_LOCK_TTL_MS`) | `600000` |
    pub fn from_env() -> Self {
        let cron_pattern =
            std::env::var("LOW_STOCK_DIGEST_CRON").unwrap_or_else(|_| DEFAULT_CRON.to_string());

        let timezone =
            std::env::var("CRON_TZ").unwrap_or_else(|_| DEFAULT_TIMEZONE.to_string());

        let lock_ttl_ms = std::env::var("LOW_STOCK_DIGEST_LOCK_TTL_MS")
            .or_else(|_| std::env::var("JOB_LOCK_TTL_MS"))
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_LOCK_TTL_MS);

        Self {
            cron_pattern,
            timezone,
            lock_ttl: Duration::from_millis(lock_ttl_ms),
            scan_limit: DEFAULT_SCAN_LIMIT,
        }
    }

    pub fn with_cron(mut self, pattern: impl Into<String>) -> Self {
        self.cron_pattern = pattern.into();
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }
}

/// Summary of one digest run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct DigestReport {
    pub shops_notified: usize,
    pub items_flagged: usize,
}

/// The low-stock digest handler.
pub struct LowStockDigestJob {
    storage: Arc<dyn Storage>,
    lock: JobLock,
    config: DigestConfig,
}

impl LowStockDigestJob {
    pub fn new(storage: Arc<dyn Storage>, lock: JobLock, config: DigestConfig) -> Self {
        Self {
            storage,
            lock,
            config,
        }
    }

    pub fn config(&self) -> &DigestConfig {
        &self.config
    }

    /// Run one lock-guarded digest pass.
    pub async fn run_once(&self) -> Result<LockOutcome<DigestReport>, StorageError> {
        let opts = LockOptions::new(LOCK_NAME, self.config.lock_ttl);
        self.lock
            .with_job_lock(&opts, || self.run_digest())
            .await
    }

    /// One bounded scan across all shops, grouped in memory. Never issue
    /// a per-shop query here.
    async fn run_digest(&self) -> Result<DigestReport, StorageError> {
        let products = self
            .storage
            .get_low_stock_products(LowStockQuery {
                shop_id: None,
                limit: Some(self.config.scan_limit),
            })
            .await?;

        let mut counts: BTreeMap<ShopId, usize> = BTreeMap::new();
        for product in &products {
            *counts.entry(product.shop_id).or_default() += 1;
        }

        if counts.is_empty() {
            return Ok(DigestReport {
                shops_notified: 0,
                items_flagged: 0,
            });
        }

        let owners: HashMap<ShopId, UserId> = self
            .storage
            .get_shops()
            .await?
            .into_iter()
            .map(|shop| (shop.id, shop.owner_user_id))
            .collect();

        let mut shops_notified = 0;
        for (shop_id, count) in counts {
            let Some(owner) = owners.get(&shop_id) else {
                warn!(shop_id = %shop_id, "low-stock shop has no owner record, skipping");
                continue;
            };

            self.storage
                .create_notification(NewNotification {
                    user_id: *owner,
                    kind: NOTIFICATION_KIND.to_string(),
                    title: "Low stock alert".to_string(),
                    message: low_stock_message(count),
                })
                .await?;
            shops_notified += 1;
        }

        Ok(DigestReport {
            shops_notified,
            items_flagged: products.len(),
        })
    }
}

fn low_stock_message(count: usize) -> String {
    if count == 1 {
        "1 item is low on stock in your shop. Restock soon to avoid missed orders.".to_string()
    } else {
        format!("{count} items are low on stock in your shop. Restock soon to avoid missed orders.")
    }
}

#[async_trait]
impl JobHandler for LowStockDigestJob {
    fn kind(&self) -> JobKind {
        JobKind::LowStockDigest
    }

    async fn execute(&self, _ctx: JobContext) -> JobResult {
        match self.run_once().await {
            Ok(LockOutcome::Acquired(report)) => {
                info!(
                    shops_notified = report.shops_notified,
                    items_flagged = report.items_flagged,
                    "low-stock digest completed"
                );
                JobResult::Success
            }
            // Lock contention is not an error; the next tick tries again.
            Ok(LockOutcome::Skipped) => JobResult::Success,
            Err(e) => {
                warn!(error = %e, "low-stock digest failed");
                JobResult::Failure(e.to_string())
            }
        }
    }
}

/// Wire the digest into a queue: register the handler, register the daily
/// schedule (idempotent across restarts), and enqueue one immediate
/// startup run.
pub async fn register_low_stock_digest(
    queue: &JobQueue,
    job: LowStockDigestJob,
) -> Result<(), QueueError> {
    let config = job.config().clone();
    queue.register_handler(Arc::new(job));

    queue
        .add_repeatable_job(
            JobKind::LowStockDigest,
            serde_json::json!({}),
            &config.cron_pattern,
            RepeatOptions {
                timezone: Some(config.timezone.clone()),
            },
        )
        .await?;

    queue
        .add_job(
            JobKind::LowStockDigest,
            serde_json::json!({ "trigger": "startup" }),
            EnqueueOptions::default(),
        )
        .await?;

    Ok(())
}
