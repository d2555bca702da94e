//! Domain-change notification helpers.
//!
//! Each helper maps one mutation to the cache keys browsers hold for it
//! and fans the invalidation out to everyone who should refetch.

use mandi_core::UserId;

use crate::channel::{BroadcastReport, RealtimeChannel};

/// A booking changed (created, status update, cancellation).
///
/// Both sides of the booking get the list key and the detail key.
pub fn notify_booking_change(
    channel: &RealtimeChannel,
    customer: Option<UserId>,
    provider: Option<UserId>,
    booking_id: i64,
) -> BroadcastReport {
    channel.broadcast_invalidation(
        [customer, provider],
        ["/api/bookings".to_string(), format!("/api/bookings/{booking_id}")],
    )
}

/// An order changed (placed, fulfilled, cancelled).
pub fn notify_order_change(
    channel: &RealtimeChannel,
    buyer: Option<UserId>,
    seller: Option<UserId>,
    order_id: i64,
) -> BroadcastReport {
    channel.broadcast_invalidation(
        [buyer, seller],
        ["/api/orders".to_string(), format!("/api/orders/{order_id}")],
    )
}

/// A shop's inventory changed; the owner and every worker refetch.
pub fn notify_shop_inventory_change(
    channel: &RealtimeChannel,
    owner: Option<UserId>,
    workers: impl IntoIterator<Item = Option<UserId>>,
    shop_id: i64,
) -> BroadcastReport {
    let recipients = std::iter::once(owner).chain(workers);
    channel.broadcast_invalidation(
        recipients,
        [
            "/api/products".to_string(),
            format!("/api/shops/{shop_id}/inventory"),
        ],
    )
}
