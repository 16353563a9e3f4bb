//! Event catalog and chat storage.
//!
//! Both are collaborators of the playback engine rather than part of it: the
//! engine only needs to look an event up by id and to ask for the chat of an
//! ended event to be cleared.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// A broadcast scheduled to appear live at `start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub start: DateTime<Utc>,
    /// URI of the seekable media asset (usually an HLS playlist).
    #[serde(default, alias = "videoURL")]
    pub media: String,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn event(&self, id: &str) -> Result<Option<ScheduledEvent>>;

    /// All events, earliest start first.
    async fn events(&self) -> Result<Vec<ScheduledEvent>>;
}

pub fn parse_catalog(content: &str) -> Result<Vec<ScheduledEvent>> {
    let events: Vec<ScheduledEvent> = serde_json::from_str(content)?;
    Ok(events
        .into_iter()
        .filter(|event| {
            if event.id.trim().is_empty() {
                warn!("Skipping catalog entry without id (title={:?})", event.title);
                return false;
            }
            true
        })
        .collect())
}

fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

pub async fn fetch_catalog(source: &str) -> Result<Vec<ScheduledEvent>> {
    let text = if is_remote(source) {
        let client = reqwest::Client::builder().build()?;
        client.get(source).send().await?.error_for_status()?.text().await?
    } else {
        tokio::fs::read_to_string(source).await?
    };
    parse_catalog(&text)
}

fn index(events: Vec<ScheduledEvent>) -> HashMap<String, ScheduledEvent> {
    let mut map = HashMap::with_capacity(events.len());
    for event in events {
        if let Some(previous) = map.insert(event.id.clone(), event) {
            warn!("Duplicate event id {} in catalog, keeping the later entry", previous.id);
        }
    }
    map
}

/// In-memory event store, optionally kept in sync with a catalog file.
#[derive(Clone, Default)]
pub struct Catalog {
    events: Arc<RwLock<HashMap<String, ScheduledEvent>>>,
}

impl Catalog {
    pub fn new(events: Vec<ScheduledEvent>) -> Self {
        Self {
            events: Arc::new(RwLock::new(index(events))),
        }
    }

    pub async fn load(source: &str) -> Result<Self> {
        Ok(Self::new(fetch_catalog(source).await?))
    }

    pub async fn replace(&self, events: Vec<ScheduledEvent>) -> usize {
        let map = index(events);
        let count = map.len();
        *self.events.write().await = map;
        count
    }

    /// Reload from `source`. On failure the current events stay in place.
    pub async fn reload(&self, source: &str) -> Result<usize> {
        let events = fetch_catalog(source).await?;
        Ok(self.replace(events).await)
    }

    /// Reload whenever the catalog file changes on disk.
    ///
    /// The parent directory is watched because editors tend to replace files
    /// rather than write them in place. The returned watcher must be kept
    /// alive for as long as reloading is wanted.
    pub fn watch(&self, path: &Path) -> Result<RecommendedWatcher> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })
        .map_err(|e| Error::Catalog(e.to_string()))?;

        let file: PathBuf = path.to_path_buf();
        let dir = match file.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Catalog(e.to_string()))?;

        let events = Arc::downgrade(&self.events);
        let file_name = file.file_name().map(|n| n.to_os_string());
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if event.kind.is_access() {
                    continue;
                }
                let touches_catalog = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                if !touches_catalog {
                    continue;
                }
                let Some(events) = events.upgrade() else {
                    break;
                };
                let catalog = Catalog { events };
                let source = file.to_string_lossy();
                match catalog.reload(&source).await {
                    Ok(count) => info!("Catalog reloaded from {}: {} events", source, count),
                    Err(e) => warn!("Catalog reload from {} failed, keeping previous: {}", source, e),
                }
            }
        });

        Ok(watcher)
    }
}

#[async_trait]
impl EventStore for Catalog {
    async fn event(&self, id: &str) -> Result<Option<ScheduledEvent>> {
        Ok(self.events.read().await.get(id).cloned())
    }

    async fn events(&self) -> Result<Vec<ScheduledEvent>> {
        let mut events: Vec<ScheduledEvent> = self.events.read().await.values().cloned().collect();
        events.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)));
        Ok(events)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: u64,
    pub event_id: String,
    pub user: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn append(&self, event_id: &str, user: &str, text: &str) -> Result<ChatMessage>;

    /// Messages of one event, oldest first.
    async fn messages(&self, event_id: &str) -> Result<Vec<ChatMessage>>;

    /// New messages of one event as they are appended.
    fn listen(&self, event_id: &str) -> broadcast::Receiver<ChatMessage>;

    /// Delete every message of an event; returns how many were removed.
    async fn purge(&self, event_id: &str) -> Result<usize>;
}

struct ChatRoom {
    messages: Vec<ChatMessage>,
    tx: broadcast::Sender<ChatMessage>,
}

impl ChatRoom {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            messages: Vec::new(),
            tx,
        }
    }
}

#[derive(Default)]
pub struct MemoryChatStore {
    rooms: Mutex<HashMap<String, ChatRoom>>,
    next_id: AtomicU64,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rooms(&self) -> std::sync::MutexGuard<'_, HashMap<String, ChatRoom>> {
        self.rooms.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn append(&self, event_id: &str, user: &str, text: &str) -> Result<ChatMessage> {
        let message = ChatMessage {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            event_id: event_id.to_string(),
            user: user.to_string(),
            text: text.to_string(),
            timestamp: Utc::now(),
        };
        let mut rooms = self.rooms();
        let room = rooms.entry(event_id.to_string()).or_insert_with(ChatRoom::new);
        room.messages.push(message.clone());
        let _ = room.tx.send(message.clone());
        Ok(message)
    }

    async fn messages(&self, event_id: &str) -> Result<Vec<ChatMessage>> {
        let mut messages = self
            .rooms()
            .get(event_id)
            .map(|room| room.messages.clone())
            .unwrap_or_default();
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(messages)
    }

    fn listen(&self, event_id: &str) -> broadcast::Receiver<ChatMessage> {
        self.rooms()
            .entry(event_id.to_string())
            .or_insert_with(ChatRoom::new)
            .tx
            .subscribe()
    }

    async fn purge(&self, event_id: &str) -> Result<usize> {
        let mut rooms = self.rooms();
        let Some(room) = rooms.get_mut(event_id) else {
            return Ok(0);
        };
        let removed = room.messages.len();
        room.messages.clear();
        if room.tx.receiver_count() == 0 {
            rooms.remove(event_id);
        }
        info!("Purged {} chat message(s) for event {}", removed, event_id);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"[
        {"id": "b7c1", "title": "Sandmeyer Reaction", "start": "2025-07-03T20:15:00+05:30",
         "media": "https://cdn.example/429e/playlist.m3u8"},
        {"id": "a001", "title": "Organic Basics", "start": "2025-07-01T09:00:00Z",
         "videoURL": "https://cdn.example/a001/playlist.m3u8"},
        {"id": "", "title": "broken", "start": "2025-07-01T09:00:00Z"}
    ]"#;

    #[test]
    fn test_parse_catalog() {
        let events = parse_catalog(CATALOG).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, "b7c1");
        assert_eq!(events[0].start.to_rfc3339(), "2025-07-03T14:45:00+00:00");
        assert_eq!(events[1].media, "https://cdn.example/a001/playlist.m3u8");
    }

    #[test]
    fn test_parse_catalog_rejects_garbage() {
        assert!(matches!(parse_catalog("{not json"), Err(Error::Json(_))));
    }

    #[tokio::test]
    async fn test_catalog_lookup_and_order() {
        let catalog = Catalog::new(parse_catalog(CATALOG).unwrap());
        let events = catalog.events().await.unwrap();
        assert_eq!(
            events.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            vec!["a001", "b7c1"]
        );
        assert!(catalog.event("b7c1").await.unwrap().is_some());
        assert!(catalog.event("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_catalog_duplicate_ids_keep_last() {
        let mut events = parse_catalog(CATALOG).unwrap();
        let mut dup = events[0].clone();
        dup.title = "Rescheduled".to_string();
        events.push(dup);
        let catalog = Catalog::default();
        assert_eq!(catalog.replace(events).await, 2);
        assert_eq!(catalog.event("b7c1").await.unwrap().unwrap().title, "Rescheduled");
    }

    #[tokio::test]
    async fn test_catalog_reload_from_file() {
        let path = std::env::temp_dir().join(format!("pseudolive-catalog-{}.json", std::process::id()));
        tokio::fs::write(&path, CATALOG).await.unwrap();
        let source = path.to_string_lossy().to_string();
        let catalog = Catalog::load(&source).await.unwrap();
        assert_eq!(catalog.events().await.unwrap().len(), 2);

        tokio::fs::write(&path, "[]").await.unwrap();
        assert_eq!(catalog.reload(&source).await.unwrap(), 0);

        tokio::fs::write(&path, "oops").await.unwrap();
        assert!(catalog.reload(&source).await.is_err());
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_chat_append_list_purge() {
        let chat = MemoryChatStore::new();
        let mut rx = chat.listen("ev1");
        chat.append("ev1", "ada", "hello").await.unwrap();
        chat.append("ev1", "bob", "hi ada").await.unwrap();
        chat.append("ev2", "eve", "wrong room").await.unwrap();

        let messages = chat.messages("ev1").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text, "hello");
        assert_eq!(messages[1].user, "bob");
        assert_eq!(rx.recv().await.unwrap().text, "hello");

        assert_eq!(chat.purge("ev1").await.unwrap(), 2);
        assert!(chat.messages("ev1").await.unwrap().is_empty());
        assert_eq!(chat.messages("ev2").await.unwrap().len(), 1);
        assert_eq!(chat.purge("nobody").await.unwrap(), 0);
    }
}
