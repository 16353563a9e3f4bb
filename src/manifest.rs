//! HLS playlist probing, used to learn an asset's duration before any
//! viewer's media engine reports it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Url;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::store::ScheduledEvent;

lazy_static! {
    static ref RE_EXTINF: Regex = Regex::new(r"^#EXTINF:\s*([0-9]+(?:\.[0-9]+)?)").unwrap();
}

#[derive(Debug, Clone, PartialEq)]
pub enum Playlist {
    /// Variant playlist URIs, in declaration order.
    Master { variants: Vec<String> },
    Media {
        duration: f64,
        segments: usize,
        /// `#EXT-X-ENDLIST` present, i.e. the asset is complete.
        ended: bool,
    },
}

pub fn parse_playlist(content: &str) -> Result<Playlist> {
    let mut lines = content.lines().map(str::trim).filter(|l| !l.is_empty());
    if lines.next() != Some("#EXTM3U") {
        return Err(Error::Manifest("missing #EXTM3U header".to_string()));
    }

    let mut variants = Vec::new();
    let mut expect_variant = false;
    let mut duration = 0.0;
    let mut segments = 0;
    let mut ended = false;

    for line in lines {
        if line.starts_with("#EXT-X-STREAM-INF") {
            expect_variant = true;
        } else if let Some(caps) = RE_EXTINF.captures(line) {
            duration += caps[1].parse::<f64>().unwrap_or(0.0);
            segments += 1;
        } else if line == "#EXT-X-ENDLIST" {
            ended = true;
        } else if !line.starts_with('#') && expect_variant {
            variants.push(line.to_string());
            expect_variant = false;
        }
    }

    if !variants.is_empty() {
        return Ok(Playlist::Master { variants });
    }
    Ok(Playlist::Media {
        duration,
        segments,
        ended,
    })
}

impl Playlist {
    /// Length of a finished media playlist. A playlist without
    /// `#EXT-X-ENDLIST` is still being written, so its segment sum says
    /// nothing about the asset's length.
    pub fn total_duration(&self) -> Option<f64> {
        match self {
            Playlist::Media {
                duration,
                segments,
                ended: true,
            } if *segments > 0 => Some(*duration),
            _ => None,
        }
    }
}

/// Fetch `url` and return the total duration of its media playlist,
/// following the first variant of a master playlist.
pub async fn probe_duration(client: &reqwest::Client, url: &str) -> Result<f64> {
    let mut current = Url::parse(url).map_err(|e| Error::Manifest(format!("{}: {}", url, e)))?;
    // one hop from master to media playlist
    for _ in 0..2 {
        let body = client
            .get(current.clone())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let playlist = parse_playlist(&body)?;
        match playlist {
            Playlist::Media { segments: 0, .. } => {
                return Err(Error::Manifest(format!("{} has no segments", current)));
            }
            Playlist::Media { ended: false, .. } => {
                return Err(Error::Manifest(format!("{} is still open (no #EXT-X-ENDLIST)", current)));
            }
            Playlist::Media { duration, .. } => return Ok(duration),
            Playlist::Master { variants } => {
                let first = &variants[0];
                current = current
                    .join(first)
                    .map_err(|e| Error::Manifest(format!("{}: {}", first, e)))?;
                debug!("Following variant playlist {}", current);
            }
        }
    }
    Err(Error::Manifest(format!("{} nests master playlists", url)))
}

/// Probe results are tied to the media locator, so a catalog reload that
/// points an event at new media starts over.
type ProbeKey = (String, String);

fn probe_key(event: &ScheduledEvent) -> ProbeKey {
    (event.id.clone(), event.media.clone())
}

/// Per-event cache of probed durations. Probes run in the background; until
/// one finishes, sessions start without a duration hint. A failed probe is
/// not retried before `retry_after` has passed.
#[derive(Clone)]
pub struct Durations {
    client: reqwest::Client,
    enabled: bool,
    retry_after: Duration,
    known: Arc<Mutex<HashMap<ProbeKey, f64>>>,
    failed: Arc<Mutex<HashMap<ProbeKey, Instant>>>,
    in_flight: Arc<Mutex<HashSet<ProbeKey>>>,
}

impl Durations {
    pub fn new(enabled: bool, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self {
            client,
            enabled,
            retry_after: DEFAULT_RETRY_AFTER,
            known: Arc::new(Mutex::new(HashMap::new())),
            failed: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, Duration::from_secs(10))
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn get(&self, event: &ScheduledEvent) -> Option<f64> {
        lock(&self.known).get(&probe_key(event)).copied()
    }

    pub fn insert(&self, event: &ScheduledEvent, duration: f64) {
        lock(&self.known).insert(probe_key(event), duration);
    }

    fn backing_off(&self, key: &ProbeKey) -> bool {
        let mut failed = lock(&self.failed);
        match failed.get(key) {
            Some(at) if at.elapsed() < self.retry_after => true,
            Some(_) => {
                failed.remove(key);
                false
            }
            None => false,
        }
    }

    /// Start a probe for `event` unless one is cached, already running, or
    /// failed recently.
    pub fn ensure_probe(&self, event: &ScheduledEvent) {
        if !self.enabled || event.media.trim().is_empty() || self.get(event).is_some() {
            return;
        }
        let key = probe_key(event);
        if self.backing_off(&key) || !lock(&self.in_flight).insert(key.clone()) {
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            let (event_id, url) = &key;
            match probe_duration(&this.client, url).await {
                Ok(duration) => {
                    info!("Event {} media lasts {:.1}s", event_id, duration);
                    lock(&this.known).insert(key.clone(), duration);
                }
                Err(e) => {
                    warn!(
                        "Duration probe for event {} failed, retrying in {:?}: {}",
                        event_id, this.retry_after, e
                    );
                    lock(&this.failed).insert(key.clone(), Instant::now());
                }
            }
            lock(&this.in_flight).remove(&key);
        });
    }
}

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
