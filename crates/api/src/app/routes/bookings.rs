//! Booking change hooks.
//!
//! Booking records live upstream; this endpoint is the post-mutation
//! hook that pushes cache invalidations to both parties.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    response::IntoResponse,
    routing::post,
};
use serde_json::json;

use mandi_core::UserId;
use mandi_realtime::notify_booking_change;

use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new().route("/:id/changed", post(booking_changed))
}

#[derive(Debug, serde::Deserialize)]
pub struct BookingChangedBody {
    pub customer_id: Option<i64>,
    pub provider_id: Option<i64>,
}

/// POST /api/bookings/:id/changed
pub async fn booking_changed(
    Extension(services): Extension<Arc<AppServices>>,
    Path(booking_id): Path<i64>,
    Json(body): Json<BookingChangedBody>,
) -> axum::response::Response {
    let report = notify_booking_change(
        &services.realtime,
        body.customer_id.map(UserId::new),
        body.provider_id.map(UserId::new),
        booking_id,
    );

    Json(json!({
        "recipients": report.recipients,
        "frames_sent": report.frames_sent,
    }))
    .into_response()
}
