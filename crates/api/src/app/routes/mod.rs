use axum::Router;

pub mod admin;
pub mod bookings;
pub mod orders;
pub mod realtime;
pub mod system;

/// Router for all `/api` endpoints.
pub fn router() -> Router {
    Router::new()
        .nest("/api/realtime", realtime::router())
        .nest("/api/bookings", bookings::router())
        .nest("/api/orders", orders::router())
        .nest("/api/admin", admin::router())
}
