//! `mandi-realtime`: server-sent-events invalidation channel.
//!
//! Process-local fan-out: each instance holds only its own clients'
//! connections, tracks them per user with hard connection caps, and pushes
//! `invalidate` frames so browsers can drop stale cache entries. Cross-
//! process fan-out is the caller's concern (trigger the broadcast on every
//! instance).

pub mod channel;
pub mod client;
pub mod notify;

pub use channel::{
    BroadcastReport, ConnectionId, RealtimeChannel, RealtimeConfig, RealtimeStats, RegisterError,
    normalize_keys, normalize_recipients,
};
pub use client::{ChannelClient, ClientError, RealtimeClient, RecordingClient, sse_frame};
pub use notify::{notify_booking_change, notify_order_change, notify_shop_inventory_change};
