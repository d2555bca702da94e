//! Operational endpoints: monitoring summary and manual job triggers.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::Extension,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;

use mandi_jobs::{EnqueueOptions, JobKind};

use crate::app::errors::queue_error_to_response;
use crate::app::services::AppServices;

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

pub fn router() -> Router {
    Router::new()
        .route("/monitoring/summary", get(monitoring_summary))
        .route("/jobs/low-stock-digest/run", post(run_low_stock_digest))
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// GET /api/admin/monitoring/summary
pub async fn monitoring_summary(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    let jobs = match services.queue.stats().await {
        Ok(stats) => stats,
        Err(err) => return queue_error_to_response(err),
    };
    let realtime = services.realtime.stats();

    Json(json!({
        "jobs": jobs,
        "realtime": realtime,
    }))
    .into_response()
}

/// POST /api/admin/jobs/low-stock-digest/run
///
/// Enqueues one off-schedule digest run. The distributed lock still
/// applies, so a manual run never overlaps the scheduled one.
pub async fn run_low_stock_digest(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    match services
        .queue
        .add_job(
            JobKind::LowStockDigest,
            json!({ "trigger": "manual" }),
            EnqueueOptions::default(),
        )
        .await
    {
        Ok(job_id) => Json(json!({ "job_id": job_id })).into_response(),
        Err(err) => queue_error_to_response(err),
    }
}
