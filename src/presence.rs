//! Live attendance: who is watching which event right now.
//!
//! Entries are keyed by `(event_id, client_id)`. A client joins through a
//! [`PresenceGuard`] owned by its server-side connection task; when that task
//! observes the connection going away (close frame, socket error, heartbeat
//! timeout) the guard is dropped and the entry disappears without any
//! cooperation from the client. Explicit `leave` is the polite path.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::metrics::PRESENCE_ONLINE;

/// Opaque per-tab identity. Random 128 bits, not a credential.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ClientId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceEntry {
    pub event_id: String,
    pub client_id: ClientId,
    pub online: bool,
    pub joined_at: DateTime<Utc>,
    #[serde(skip)]
    last_seen: Instant,
    #[serde(skip)]
    connection: u64,
}

struct Room {
    entries: HashMap<ClientId, PresenceEntry>,
    count: watch::Sender<usize>,
}

impl Room {
    fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            entries: HashMap::new(),
            count,
        }
    }

    fn is_unused(&self) -> bool {
        self.entries.is_empty() && self.count.receiver_count() == 0
    }
}

struct Inner {
    rooms: Mutex<HashMap<String, Room>>,
    next_connection: AtomicU64,
    heartbeat_timeout: Duration,
}

impl Inner {
    fn rooms(&self) -> MutexGuard<'_, HashMap<String, Room>> {
        self.rooms.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Recount from the entry set and notify subscribers.
    fn publish(event_id: &str, room: &Room) {
        let online = room.entries.values().filter(|e| e.online).count();
        room.count.send_replace(online);
        PRESENCE_ONLINE.with_label_values(&[event_id]).set(online as i64);
    }

    /// Remove `client_id` if it is still held by `connection` (any
    /// connection when `None`). Returns whether an entry went away.
    fn remove(&self, event_id: &str, client_id: &ClientId, connection: Option<u64>) -> bool {
        let mut rooms = self.rooms();
        let Some(room) = rooms.get_mut(event_id) else {
            return false;
        };
        let owned = room
            .entries
            .get(client_id)
            .is_some_and(|e| connection.map_or(true, |c| e.connection == c));
        if !owned {
            return false;
        }
        room.entries.remove(client_id);
        Self::publish(event_id, room);
        if room.is_unused() {
            rooms.remove(event_id);
            Self::forget(event_id);
        }
        true
    }

    /// Drop the gauge series of a room that no longer exists.
    fn forget(event_id: &str) {
        let _ = PRESENCE_ONLINE.remove_label_values(&[event_id]);
    }
}

/// Per-event presence registry shared by every connection of the process.
#[derive(Clone)]
pub struct PresenceRegistry {
    inner: Arc<Inner>,
}

impl PresenceRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                rooms: Mutex::new(HashMap::new()),
                next_connection: AtomicU64::new(1),
                heartbeat_timeout,
            }),
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.inner.heartbeat_timeout
    }

    /// Mark `client_id` present for `event_id`.
    ///
    /// Joining again with the same id replaces the entry; the newest guard
    /// owns it and older guards no longer remove it when dropped.
    pub fn join(&self, event_id: &str, client_id: ClientId) -> PresenceGuard {
        let connection = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        let entry = PresenceEntry {
            event_id: event_id.to_string(),
            client_id: client_id.clone(),
            online: true,
            joined_at: Utc::now(),
            last_seen: Instant::now(),
            connection,
        };
        {
            let mut rooms = self.inner.rooms();
            let room = rooms.entry(event_id.to_string()).or_insert_with(Room::new);
            room.entries.insert(client_id.clone(), entry);
            Inner::publish(event_id, room);
            info!(
                "Client {} joined event {} (online={})",
                client_id,
                event_id,
                *room.count.borrow()
            );
        }
        PresenceGuard {
            registry: Arc::downgrade(&self.inner),
            event_id: event_id.to_string(),
            client_id,
            connection,
            released: false,
        }
    }

    /// Remove an entry right away, whoever holds it.
    pub fn leave(&self, event_id: &str, client_id: &ClientId) -> bool {
        let removed = self.inner.remove(event_id, client_id, None);
        if removed {
            info!("Client {} left event {}", client_id, event_id);
        }
        removed
    }

    /// Record liveness for the heartbeat reaper.
    pub fn heartbeat(&self, event_id: &str, client_id: &ClientId) {
        if let Some(entry) = self
            .inner
            .rooms()
            .get_mut(event_id)
            .and_then(|room| room.entries.get_mut(client_id))
        {
            entry.last_seen = Instant::now();
        }
    }

    /// Online count for `event_id`, updated on every change to its entries.
    pub fn subscribe(&self, event_id: &str) -> watch::Receiver<usize> {
        self.inner
            .rooms()
            .entry(event_id.to_string())
            .or_insert_with(Room::new)
            .count
            .subscribe()
    }

    pub fn count(&self, event_id: &str) -> usize {
        self.inner
            .rooms()
            .get(event_id)
            .map(|room| room.entries.values().filter(|e| e.online).count())
            .unwrap_or(0)
    }

    pub fn entries(&self, event_id: &str) -> Vec<PresenceEntry> {
        self.inner
            .rooms()
            .get(event_id)
            .map(|room| room.entries.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop entries that have not been seen within the heartbeat timeout.
    /// Covers transports that cannot observe a disconnect.
    pub fn reap_stale(&self) -> usize {
        let timeout = self.inner.heartbeat_timeout;
        let mut reaped = 0;
        let mut rooms = self.inner.rooms();
        for (event_id, room) in rooms.iter_mut() {
            let before = room.entries.len();
            room.entries.retain(|client_id, entry| {
                let alive = entry.last_seen.elapsed() <= timeout;
                if !alive {
                    warn!(
                        "Presence of client {} on event {} timed out after {:?}",
                        client_id, event_id, timeout
                    );
                }
                alive
            });
            if room.entries.len() != before {
                reaped += before - room.entries.len();
                Inner::publish(event_id, room);
            }
        }
        rooms.retain(|event_id, room| {
            let unused = room.is_unused();
            if unused {
                Inner::forget(event_id);
            }
            !unused
        });
        reaped
    }

    /// Run [`reap_stale`](Self::reap_stale) every `interval` until the
    /// registry is dropped.
    pub fn spawn_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                PresenceRegistry { inner }.reap_stale();
            }
        })
    }
}

/// Holds one presence entry for as long as the connection lives.
pub struct PresenceGuard {
    registry: Weak<Inner>,
    event_id: String,
    client_id: ClientId,
    connection: u64,
    released: bool,
}

impl PresenceGuard {
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn heartbeat(&self) {
        if let Some(inner) = self.registry.upgrade() {
            PresenceRegistry { inner }.heartbeat(&self.event_id, &self.client_id);
        }
    }

    /// Graceful leave.
    pub fn leave(mut self) {
        self.release("left");
    }

    fn release(&mut self, reason: &str) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(inner) = self.registry.upgrade() {
            if inner.remove(&self.event_id, &self.client_id, Some(self.connection)) {
                info!(
                    "Client {} {} event {}",
                    self.client_id, reason, self.event_id
                );
            }
        }
    }
}

impl Drop for PresenceGuard {
    fn drop(&mut self) {
        self.release("disconnected from");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PresenceRegistry {
        PresenceRegistry::new(Duration::from_secs(30))
    }

    #[test]
    fn test_client_ids_are_unique() {
        let a = ClientId::random();
        let b = ClientId::random();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn test_join_twice_is_one_entry() {
        let presence = registry();
        let _first = presence.join("ev", ClientId::from("tab-1"));
        let _second = presence.join("ev", ClientId::from("tab-1"));
        assert_eq!(presence.entries("ev").len(), 1);
        assert_eq!(presence.count("ev"), 1);
    }

    #[test]
    fn test_stale_guard_does_not_remove_rejoined_entry() {
        let presence = registry();
        let first = presence.join("ev", ClientId::from("tab-1"));
        let second = presence.join("ev", ClientId::from("tab-1"));
        drop(first);
        assert_eq!(presence.count("ev"), 1);
        drop(second);
        assert_eq!(presence.count("ev"), 0);
    }

    #[tokio::test]
    async fn test_disconnect_updates_all_subscribers() {
        let presence = registry();
        let mut watcher = presence.subscribe("ev");
        let a = presence.join("ev", ClientId::random());
        let b = presence.join("ev", ClientId::random());
        let c = presence.join("ev", ClientId::random());
        assert_eq!(*watcher.borrow_and_update(), 3);

        // connection drops without an explicit leave
        drop(b);
        watcher.changed().await.unwrap();
        assert_eq!(*watcher.borrow_and_update(), 2);

        a.leave();
        assert_eq!(*watcher.borrow_and_update(), 1);
        assert!(presence.leave("ev", c.client_id()));
        assert_eq!(*watcher.borrow(), 0);
        drop(c);
        assert_eq!(presence.count("ev"), 0);
    }

    #[test]
    fn test_events_are_counted_independently() {
        let presence = registry();
        let list_a = presence.subscribe("a");
        let list_b = presence.subscribe("b");
        let _x = presence.join("a", ClientId::random());
        let _y = presence.join("a", ClientId::random());
        let _z = presence.join("b", ClientId::random());
        assert_eq!(*list_a.borrow(), 2);
        assert_eq!(*list_b.borrow(), 1);
        assert_eq!(presence.count("c"), 0);
    }

    #[test]
    fn test_count_matches_online_set_for_any_sequence() {
        let presence = registry();
        let ids: Vec<ClientId> = (0..6).map(|i| ClientId::from(format!("c{i}"))).collect();
        let mut guards: Vec<Option<PresenceGuard>> = (0..6).map(|_| None).collect();
        // deterministic pseudo-random interleaving of joins, leaves and drops
        let mut seed: u32 = 7;
        for _ in 0..200 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let i = (seed >> 16) as usize % ids.len();
            match (seed >> 8) % 3 {
                0 => guards[i] = Some(presence.join("ev", ids[i].clone())),
                1 => {
                    presence.leave("ev", &ids[i]);
                }
                _ => guards[i] = None,
            }
            let online = presence.entries("ev").iter().filter(|e| e.online).count();
            assert_eq!(presence.count("ev"), online);
            assert_eq!(*presence.subscribe("ev").borrow(), online);
        }
    }

    #[test]
    fn test_gauge_series_dropped_with_room() {
        let presence = registry();
        let series = r#"event_id="gauge-room""#;
        let guard = presence.join("gauge-room", ClientId::random());
        assert!(crate::metrics::gather_metrics().contains(series));
        guard.leave();
        assert!(!crate::metrics::gather_metrics().contains(series));

        let quiet = PresenceRegistry::new(Duration::ZERO);
        let _guard = quiet.join("gauge-reaped", ClientId::random());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(quiet.reap_stale(), 1);
        assert!(!crate::metrics::gather_metrics().contains(r#"event_id="gauge-reaped""#));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_removes_silent_clients() {
        let presence = PresenceRegistry::new(Duration::from_secs(10));
        let quiet = presence.join("ev", ClientId::from("quiet"));
        let chatty = presence.join("ev", ClientId::from("chatty"));
        tokio::time::advance(Duration::from_secs(6)).await;
        chatty.heartbeat();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(presence.reap_stale(), 1);
        assert_eq!(presence.count("ev"), 1);
        assert_eq!(presence.entries("ev")[0].client_id, ClientId::from("chatty"));
        drop(quiet);
        assert_eq!(presence.count("ev"), 1);
    }
}
