//! Connection registry and broadcast fan-out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use mandi_core::UserId;

use crate::client::RealtimeClient;

const DEFAULT_HEARTBEAT_MS: u64 = 30_000;
const MIN_HEARTBEAT_MS: u64 = 10_000;
const MAX_HEARTBEAT_MS: u64 = 60_000;
const DEFAULT_MAX_PER_USER: usize = 10;
const DEFAULT_MAX_TOTAL: usize = 1000;

/// Channel configuration.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Hard cap per user; the user's oldest connection is evicted to make
    /// room.
    pub max_connections_per_user: usize,
    /// Hard cap per process; new registrations beyond it are rejected.
    pub max_total_connections: usize,
    /// Heartbeat interval keeping intermediaries from closing idle
    /// connections.
    pub heartbeat: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            max_connections_per_user: DEFAULT_MAX_PER_USER,
            max_total_connections: DEFAULT_MAX_TOTAL,
            heartbeat: Duration::from_millis(DEFAULT_HEARTBEAT_MS),
        }
    }
}

impl RealtimeConfig {
    /// Build from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `REALTIME_MAX_CONNECTIONS_PER_USER` | `10` |
    /// | `REALTIME_MAX_TOTAL_CONNECTIONS` | `1000` |
    /// | `REALTIME_HEARTBEAT_MS` | `30000`, clamped to 10000..=60000 |
    pub fn from_env() -> Self {
        let max_connections_per_user = std::env::var("REALTIME_MAX_CONNECTIONS_PER_USER")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_PER_USER)
            .max(1);

        let max_total_connections = std::env::var("REALTIME_MAX_TOTAL_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_TOTAL)
            .max(1);

        let heartbeat_ms = std::env::var("REALTIME_HEARTBEAT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_HEARTBEAT_MS)
            .clamp(MIN_HEARTBEAT_MS, MAX_HEARTBEAT_MS);

        Self {
            max_connections_per_user,
            max_total_connections,
            heartbeat: Duration::from_millis(heartbeat_ms),
        }
    }

    pub fn with_max_per_user(mut self, max: usize) -> Self {
        self.max_connections_per_user = max.max(1);
        self
    }

    pub fn with_max_total(mut self, max: usize) -> Self {
        self.max_total_connections = max.max(1);
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

/// Registration failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    /// The process-wide connection cap is reached.
    #[error("global connection limit reached")]
    AtCapacity,

    /// The initial `connected` frame could not be written.
    #[error("connected handshake failed: {0}")]
    Handshake(String),
}

/// Identifier of one registered connection (process-local).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

/// Summary of one broadcast call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Distinct recipients after normalization.
    pub recipients: usize,
    /// Frames successfully written.
    pub frames_sent: usize,
    /// Connections evicted due to write failures.
    pub evicted: usize,
}

/// Channel statistics.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct RealtimeStats {
    pub users: usize,
    pub connections: usize,
}

struct ConnectionEntry {
    id: ConnectionId,
    client: Arc<dyn RealtimeClient>,
    connected_at: DateTime<Utc>,
    heartbeat: Option<AbortHandle>,
}

#[derive(Default)]
struct Registry {
    users: HashMap<UserId, Vec<ConnectionEntry>>,
    total: usize,
    next_id: u64,
}

struct ChannelInner {
    config: RealtimeConfig,
    state: Mutex<Registry>,
}

/// The realtime invalidation channel.
///
/// Owns the `user → connections` registry exclusively; other components
/// interact only through `register`, `remove` and the broadcast calls.
#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<ChannelInner>,
}

impl RealtimeChannel {
    /// Must be created inside a tokio runtime (heartbeats are spawned
    /// tasks).
    pub fn new(config: RealtimeConfig) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                config,
                state: Mutex::new(Registry::default()),
            }),
        }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.inner.config
    }

    /// Register a connection for `user_id`.
    ///
    /// Enforces both caps: the global cap rejects the registration, the
    /// per-user cap evicts that user's oldest connection. On success the
    /// client has already received its `connected` frame and a heartbeat
    /// task is running.
    pub fn register(
        &self,
        client: Arc<dyn RealtimeClient>,
        user_id: UserId,
    ) -> Result<ConnectionId, RegisterError> {
        let id = {
            let mut state = self.inner.state.lock().unwrap();

            if state.total >= self.inner.config.max_total_connections {
                warn!(user_id = %user_id, total = state.total, "realtime registration rejected: global cap");
                return Err(RegisterError::AtCapacity);
            }

            // Handshake while still holding the registry lock: the entry
            // must not be broadcast-visible until `connected` is on the
            // wire, or an `invalidate` frame could arrive first.
            if let Err(e) = client.send("connected", &json!({ "connected": true })) {
                return Err(RegisterError::Handshake(e.to_string()));
            }

            let evicted = {
                let connections = state.users.entry(user_id).or_default();
                if connections.len() >= self.inner.config.max_connections_per_user {
                    // Entries are in connect order, so index 0 is the oldest.
                    Some(connections.remove(0))
                } else {
                    None
                }
            };
            if let Some(evicted) = evicted {
                if let Some(handle) = evicted.heartbeat {
                    handle.abort();
                }
                evicted.client.close();
                state.total -= 1;
                warn!(
                    user_id = %user_id,
                    connection = ?evicted.id,
                    connected_at = %evicted.connected_at,
                    "evicted oldest connection: per-user cap"
                );
            }

            state.next_id += 1;
            let id = ConnectionId(state.next_id);
            state.users.entry(user_id).or_default().push(ConnectionEntry {
                id,
                client: client.clone(),
                connected_at: Utc::now(),
                heartbeat: None,
            });
            state.total += 1;
            id
        };

        let heartbeat = self.spawn_heartbeat(client, user_id, id);
        {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(entry) = state
                .users
                .get_mut(&user_id)
                .and_then(|conns| conns.iter_mut().find(|c| c.id == id))
            {
                entry.heartbeat = Some(heartbeat);
            } else {
                // Removed between handshake and now; stop the timer.
                heartbeat.abort();
            }
        }

        debug!(user_id = %user_id, connection = ?id, "realtime client registered");
        Ok(id)
    }

    fn spawn_heartbeat(
        &self,
        client: Arc<dyn RealtimeClient>,
        user_id: UserId,
        id: ConnectionId,
    ) -> AbortHandle {
        let channel = self.clone();
        let interval = self.inner.config.heartbeat;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if client.send("heartbeat", &json!({})).is_err() {
                    warn!(user_id = %user_id, connection = ?id, "heartbeat write failed, removing connection");
                    channel.remove(user_id, id);
                    break;
                }
            }
        })
        .abort_handle()
    }

    /// Remove one connection (transport closed, eviction, write failure).
    pub fn remove(&self, user_id: UserId, id: ConnectionId) {
        let mut state = self.inner.state.lock().unwrap();
        let Some(connections) = state.users.get_mut(&user_id) else {
            return;
        };
        let Some(index) = connections.iter().position(|c| c.id == id) else {
            return;
        };

        let entry = connections.remove(index);
        if connections.is_empty() {
            state.users.remove(&user_id);
        }
        state.total -= 1;

        if let Some(handle) = entry.heartbeat {
            handle.abort();
        }
        entry.client.close();
        debug!(user_id = %user_id, connection = ?id, "realtime client removed");
    }

    /// Broadcast an invalidation to every connection of every recipient.
    ///
    /// Recipients and keys are normalized (dedup, drop missing/empty,
    /// first-seen order). A write failure evicts that one connection and
    /// the broadcast continues.
    pub fn broadcast_invalidation<R, K, S>(&self, recipients: R, keys: K) -> BroadcastReport
    where
        R: IntoIterator<Item = Option<UserId>>,
        K: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let recipients = normalize_recipients(recipients);
        let keys = normalize_keys(keys);

        let mut report = BroadcastReport {
            recipients: recipients.len(),
            ..Default::default()
        };
        if recipients.is_empty() || keys.is_empty() {
            return report;
        }

        let payload = json!({ "keys": keys });

        // Snapshot targets so sends happen outside the registry lock.
        let targets: Vec<(UserId, ConnectionId, Arc<dyn RealtimeClient>)> = {
            let state = self.inner.state.lock().unwrap();
            recipients
                .iter()
                .filter_map(|user_id| state.users.get(user_id).map(|conns| (user_id, conns)))
                .flat_map(|(user_id, conns)| {
                    conns
                        .iter()
                        .map(|c| (*user_id, c.id, c.client.clone()))
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        for (user_id, id, client) in targets {
            match client.send("invalidate", &payload) {
                Ok(()) => report.frames_sent += 1,
                Err(e) => {
                    warn!(user_id = %user_id, connection = ?id, error = %e, "invalidate write failed, evicting connection");
                    self.remove(user_id, id);
                    report.evicted += 1;
                }
            }
        }

        report
    }

    pub fn stats(&self) -> RealtimeStats {
        let state = self.inner.state.lock().unwrap();
        RealtimeStats {
            users: state.users.len(),
            connections: state.total,
        }
    }

    /// Drop every connection and stop all heartbeats (process shutdown).
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock().unwrap();
        for (_, connections) in state.users.drain() {
            for entry in connections {
                if let Some(handle) = entry.heartbeat {
                    handle.abort();
                }
                entry.client.close();
            }
        }
        state.total = 0;
    }
}

/// Drop missing recipients and deduplicate, preserving first-seen order.
pub fn normalize_recipients<R>(raw: R) -> Vec<UserId>
where
    R: IntoIterator<Item = Option<UserId>>,
{
    let mut seen = std::collections::HashSet::new();
    raw.into_iter()
        .flatten()
        .filter(|id| seen.insert(*id))
        .collect()
}

/// Drop empty keys and deduplicate, preserving first-seen order.
pub fn normalize_keys<K, S>(raw: K) -> Vec<String>
where
    K: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen = std::collections::HashSet::new();
    raw.into_iter()
        .map(Into::into)
        .filter(|key| !key.is_empty())
        .filter(|key| seen.insert(key.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RecordingClient;
    use proptest::prelude::*;

    fn user(id: i64) -> UserId {
        UserId::new(id)
    }

    fn channel() -> RealtimeChannel {
        RealtimeChannel::new(RealtimeConfig::default())
    }

    #[tokio::test]
    async fn register_sends_connected_frame() {
        let channel = channel();
        let client = Arc::new(RecordingClient::new());

        channel.register(client.clone(), user(7)).unwrap();

        assert_eq!(
            client.frames_named("connected"),
            vec![json!({"connected": true})]
        );
        assert_eq!(channel.stats().connections, 1);
    }

    #[tokio::test]
    async fn broadcast_dedupes_recipients_and_keys() {
        let channel = channel();
        let a = Arc::new(RecordingClient::new());
        let b = Arc::new(RecordingClient::new());
        channel.register(a.clone(), user(7)).unwrap();
        channel.register(b.clone(), user(7)).unwrap();

        let report = channel.broadcast_invalidation(
            [Some(user(7)), Some(user(7)), None],
            ["", "/api/orders", "/api/orders"],
        );

        assert_eq!(report.recipients, 1);
        assert_eq!(report.frames_sent, 2);

        for client in [&a, &b] {
            assert_eq!(
                client.frames_named("invalidate"),
                vec![json!({"keys": ["/api/orders"]})]
            );
        }
    }

    #[tokio::test]
    async fn broadcast_skips_users_without_connections() {
        let channel = channel();
        let report =
            channel.broadcast_invalidation([Some(user(1))], ["/api/orders"]);
        assert_eq!(report.frames_sent, 0);
    }

    #[tokio::test]
    async fn per_user_cap_evicts_the_oldest_connection() {
        let channel = RealtimeChannel::new(RealtimeConfig::default().with_max_per_user(2));
        let first = Arc::new(RecordingClient::new());
        let second = Arc::new(RecordingClient::new());
        let third = Arc::new(RecordingClient::new());

        channel.register(first.clone(), user(7)).unwrap();
        channel.register(second.clone(), user(7)).unwrap();
        channel.register(third.clone(), user(7)).unwrap();

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(channel.stats().connections, 2);

        channel.broadcast_invalidation([Some(user(7))], ["/api/orders"]);
        assert!(first.frames_named("invalidate").is_empty());
        assert_eq!(second.frames_named("invalidate").len(), 1);
        assert_eq!(third.frames_named("invalidate").len(), 1);
    }

    #[tokio::test]
    async fn global_cap_rejects_new_registrations() {
        let channel = RealtimeChannel::new(RealtimeConfig::default().with_max_total(2));

        channel
            .register(Arc::new(RecordingClient::new()), user(1))
            .unwrap();
        channel
            .register(Arc::new(RecordingClient::new()), user(2))
            .unwrap();

        let err = channel
            .register(Arc::new(RecordingClient::new()), user(3))
            .unwrap_err();
        assert_eq!(err, RegisterError::AtCapacity);
        assert_eq!(channel.stats().connections, 2);
    }

    #[tokio::test]
    async fn failing_connection_does_not_break_the_broadcast() {
        let channel = channel();
        let good = Arc::new(RecordingClient::new());
        let bad = Arc::new(RecordingClient::new());
        channel.register(bad.clone(), user(7)).unwrap();
        channel.register(good.clone(), user(7)).unwrap();

        bad.set_failing(true);
        let report = channel.broadcast_invalidation([Some(user(7))], ["/api/orders"]);

        assert_eq!(report.frames_sent, 1);
        assert_eq!(report.evicted, 1);
        assert_eq!(good.frames_named("invalidate").len(), 1);
        assert_eq!(channel.stats().connections, 1);
    }

    #[tokio::test]
    async fn handshake_failure_registers_nothing() {
        let channel = channel();
        let client = Arc::new(RecordingClient::new());
        client.set_failing(true);

        let err = channel.register(client, user(7)).unwrap_err();
        assert!(matches!(err, RegisterError::Handshake(_)));
        assert_eq!(channel.stats().connections, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn connected_is_always_the_first_frame_under_concurrent_broadcasts() {
        let channel = channel();

        let mut registrations = Vec::new();
        for _ in 0..16 {
            let channel = channel.clone();
            registrations.push(tokio::spawn(async move {
                let client = Arc::new(RecordingClient::new());
                channel.register(client.clone(), user(7)).unwrap();
                client
            }));
        }

        let mut broadcasts = Vec::new();
        for _ in 0..16 {
            let channel = channel.clone();
            broadcasts.push(tokio::spawn(async move {
                channel.broadcast_invalidation([Some(user(7))], ["/api/orders"]);
            }));
        }

        for join in broadcasts {
            join.await.unwrap();
        }
        for join in registrations {
            let client = join.await.unwrap();
            let frames = client.frames();
            assert_eq!(frames[0].0, "connected");
        }
    }

    #[tokio::test]
    async fn heartbeat_frames_flow_and_dead_clients_get_reaped() {
        let channel = RealtimeChannel::new(
            RealtimeConfig::default().with_heartbeat(Duration::from_millis(20)),
        );
        let client = Arc::new(RecordingClient::new());
        channel.register(client.clone(), user(7)).unwrap();

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(!client.frames_named("heartbeat").is_empty());

        client.set_failing(true);
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_eq!(channel.stats().connections, 0);
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn shutdown_clears_the_registry() {
        let channel = channel();
        let client = Arc::new(RecordingClient::new());
        channel.register(client.clone(), user(7)).unwrap();

        channel.shutdown();
        assert_eq!(channel.stats().connections, 0);
        assert!(client.is_closed());
    }

    #[test]
    fn normalization_examples() {
        assert_eq!(
            normalize_recipients([Some(user(7)), Some(user(7)), None, Some(user(3))]),
            vec![user(7), user(3)]
        );
        assert_eq!(
            normalize_keys(["", "/api/orders", "/api/orders", "/api/shops"]),
            vec!["/api/orders".to_string(), "/api/shops".to_string()]
        );
    }

    proptest! {
        #[test]
        fn recipients_are_unique_and_order_preserving(raw in proptest::collection::vec(
            proptest::option::of(-5i64..5), 0..30
        )) {
            let input: Vec<Option<UserId>> =
                raw.iter().map(|v| v.map(UserId::new)).collect();
            let normalized = normalize_recipients(input.clone());

            // No duplicates, no gaps.
            let mut seen = std::collections::HashSet::new();
            prop_assert!(normalized.iter().all(|id| seen.insert(*id)));

            // First-seen order is the order of the surviving input.
            let mut expected = Vec::new();
            let mut dedup = std::collections::HashSet::new();
            for id in input.into_iter().flatten() {
                if dedup.insert(id) {
                    expected.push(id);
                }
            }
            prop_assert_eq!(normalized, expected);
        }

        #[test]
        fn keys_are_unique_nonempty_and_order_preserving(raw in proptest::collection::vec(
            "[a-c]{0,2}", 0..30
        )) {
            let normalized = normalize_keys(raw.clone());

            prop_assert!(normalized.iter().all(|k| !k.is_empty()));

            let mut seen = std::collections::HashSet::new();
            prop_assert!(normalized.iter().all(|k| seen.insert(k.clone())));

            let mut expected = Vec::new();
            let mut dedup = std::collections::HashSet::new();
            for key in raw.into_iter().filter(|k| !k.is_empty()) {
                if dedup.insert(key.clone()) {
                    expected.push(key);
                }
            }
            prop_assert_eq!(normalized, expected);
        }
    }
}
