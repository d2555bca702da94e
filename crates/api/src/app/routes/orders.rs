//! Order change hooks.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    response::IntoResponse,
    routing::post,
};
use serde_json::json;

use mandi_core::UserId;
use mandi_realtime::notify_order_change;

use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new().route("/:id/changed", post(order_changed))
}

#[derive(Debug, serde::Deserialize)]
pub struct OrderChangedBody {
    pub buyer_id: Option<i64>,
    pub seller_id: Option<i64>,
}

/// POST /api/orders/:id/changed
pub async fn order_changed(
    Extension(services): Extension<Arc<AppServices>>,
    Path(order_id): Path<i64>,
    Json(body): Json<OrderChangedBody>,
) -> axum::response::Response {
    let report = notify_order_change(
        &services.realtime,
        body.buyer_id.map(UserId::new),
        body.seller_id.map(UserId::new),
        order_id,
    );

    Json(json!({
        "recipients": report.recipients,
        "frames_sent": report.frames_sent,
    }))
    .into_response()
}
