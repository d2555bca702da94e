use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use mandi_jobs::QueueError;

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    match err {
        QueueError::Schedule(e) => json_error(StatusCode::BAD_REQUEST, "invalid_schedule", e.to_string()),
        QueueError::NoUpcomingFire(pattern) => json_error(
            StatusCode::BAD_REQUEST,
            "invalid_schedule",
            format!("pattern {pattern:?} never fires again"),
        ),
        QueueError::Store(e) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            e.to_string(),
        ),
    }
}
