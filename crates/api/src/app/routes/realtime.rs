//! SSE subscription endpoint.
//!
//! The handler registers a channel-backed client with the realtime
//! registry and streams its frames out as the response body. Disconnects
//! surface as failed writes (the receiver is gone), which evict the
//! connection on the next heartbeat or broadcast.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{Extension, Query},
    http::{HeaderName, StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use tokio::sync::mpsc::unbounded_channel;
use tokio_stream::{StreamExt, wrappers::UnboundedReceiverStream};
use tracing::warn;

use mandi_core::UserId;
use mandi_realtime::{ChannelClient, RegisterError};

use crate::app::errors::json_error;
use crate::app::services::AppServices;

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

pub fn router() -> Router {
    Router::new().route("/subscribe", get(subscribe))
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, serde::Deserialize)]
pub struct SubscribeQuery {
    pub user_id: i64,
}

/// GET /api/realtime/subscribe?user_id=<id>
///
/// Opens a server-sent-events stream. The first frame is `connected`,
/// then `heartbeat` frames keep intermediaries from timing the
/// connection out, and `invalidate` frames carry cache keys to drop.
pub async fn subscribe(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<SubscribeQuery>,
) -> axum::response::Response {
    let user_id = UserId::new(query.user_id);

    let (tx, rx) = unbounded_channel::<String>();
    let client = Arc::new(ChannelClient::new(tx));

    if let Err(err) = services.realtime.register(client, user_id) {
        return match err {
            RegisterError::AtCapacity => json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "at_capacity",
                "realtime connection limit reached",
            ),
            RegisterError::Handshake(msg) => {
                warn!(user_id = %user_id, error = %msg, "realtime handshake failed");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "handshake_failed", msg)
            }
        };
    }

    let stream = UnboundedReceiverStream::new(rx).map(Ok::<String, Infallible>);

    // Headers set by hand so proxies neither cache nor buffer the stream.
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}
