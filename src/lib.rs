pub mod clock;
pub mod convergence;
pub mod driver;
pub mod error;
pub mod manifest;
pub mod media;
pub mod metrics;
pub mod presence;
pub mod session;
pub mod store;

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        Html, IntoResponse, Json, Response,
    },
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tracing::{debug, info, warn};

use crate::clock::{Clock, Schedule, SystemClock};
use crate::manifest::Durations;
use crate::presence::{ClientId, PresenceGuard, PresenceRegistry};
use crate::session::SyncConfig;
use crate::store::{ChatMessage, ChatStore, EventStore, ScheduledEvent};

pub use crate::error::{Error, Result};

/// Shared state behind every handler.
pub struct AppState {
    pub events: Arc<dyn EventStore>,
    pub chat: Arc<dyn ChatStore>,
    pub presence: PresenceRegistry,
    pub durations: Durations,
    /// Engine tuning handed to every watch page.
    pub sync: SyncConfig,
    pub clock: Arc<dyn Clock>,
    /// Events whose chat was already purged on ending.
    purged: Mutex<HashSet<String>>,
}

impl AppState {
    pub fn new(events: Arc<dyn EventStore>, chat: Arc<dyn ChatStore>, presence: PresenceRegistry) -> Self {
        Self {
            events,
            chat,
            presence,
            durations: Durations::disabled(),
            sync: SyncConfig::default(),
            clock: Arc::new(SystemClock),
            purged: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_durations(mut self, durations: Durations) -> Self {
        self.durations = durations;
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn require_event(&self, id: &str) -> Result<ScheduledEvent> {
        self.events
            .event(id)
            .await?
            .ok_or_else(|| Error::EventNotFound(id.to_string()))
    }

    /// Classify `event` now. The first time an event is seen ended its chat
    /// is purged.
    async fn view(&self, event: ScheduledEvent) -> EventView {
        self.durations.ensure_probe(&event);
        let duration = self.durations.get(&event);
        let schedule = self
            .sync
            .calculator()
            .classify(self.clock.now(), event.start, duration);
        self.purge_if_ended(&event.id, &schedule).await;
        let online = self.presence.count(&event.id);
        EventView {
            id: event.id,
            title: event.title,
            start: event.start,
            media: event.media,
            duration,
            schedule,
            online,
        }
    }

    async fn purge_if_ended(&self, event_id: &str, schedule: &Schedule) {
        let first = {
            let mut purged = self.purged.lock().unwrap_or_else(|e| e.into_inner());
            match schedule {
                Schedule::Ended => purged.insert(event_id.to_string()),
                // a reload may have moved the event back into the future
                _ => {
                    purged.remove(event_id);
                    false
                }
            }
        };
        if !first {
            return;
        }
        match self.chat.purge(event_id).await {
            Ok(removed) => info!("Event {} ended, removed {} chat message(s)", event_id, removed),
            Err(e) => {
                warn!("Failed to purge chat of ended event {}: {}", event_id, e);
                self.purged
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(event_id);
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Error::EventNotFound(_) => (StatusCode::NOT_FOUND, "event not found".to_string()),
            Error::BadRequest(reason) => (StatusCode::BAD_REQUEST, reason.clone()),
            _ => {
                warn!("Request failed: {}", self);
                (StatusCode::SERVICE_UNAVAILABLE, "store unavailable".to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Event plus its classification at request time.
#[derive(Debug, Clone, Serialize)]
pub struct EventView {
    pub id: String,
    pub title: String,
    pub start: DateTime<Utc>,
    pub media: String,
    pub duration: Option<f64>,
    pub schedule: Schedule,
    pub online: usize,
}

pub fn create_app(state: AppState) -> Router {
    let state = Arc::new(state);

    Router::new()
        .route("/", get(index_handler))
        .route("/watch/{id}", get(watch_handler))
        .route("/api/events", get(events_api_handler))
        .route("/api/events/{id}", get(event_api_handler))
        .route("/api/events/{id}/presence", get(presence_ws_handler))
        .route("/api/events/{id}/presence/stream", get(presence_sse_handler))
        .route(
            "/api/events/{id}/chat",
            get(chat_list_handler)
                .post(chat_post_handler)
                .delete(chat_purge_handler),
        )
        .route("/api/events/{id}/chat/stream", get(chat_sse_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(fallback_handler)
        .with_state(state)
}

async fn fallback_handler(method: Method, uri: Uri, headers: HeaderMap) -> impl IntoResponse {
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("<none>");
    info!("HTTP 404: method={} uri={} UA=\"{}\"", method, uri, user_agent);
    (StatusCode::NOT_FOUND, "Not found")
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}

async fn events_api_handler(State(state): State<Arc<AppState>>) -> Result<Json<Vec<EventView>>> {
    let mut views = Vec::new();
    for event in state.events.events().await? {
        views.push(state.view(event).await);
    }
    Ok(Json(views))
}

async fn event_api_handler(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<EventView>> {
    let event = state.require_event(&id).await?;
    Ok(Json(state.view(event).await))
}

async fn chat_list_handler(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ChatMessage>>> {
    state.require_event(&id).await?;
    Ok(Json(state.chat.messages(&id).await?))
}

#[derive(Debug, Deserialize)]
struct NewChatMessage {
    #[serde(default)]
    user: String,
    text: String,
}

async fn chat_post_handler(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewChatMessage>,
) -> Result<(StatusCode, Json<ChatMessage>)> {
    let event = state.require_event(&id).await?;
    if state.view(event).await.schedule.is_ended() {
        return Err(Error::BadRequest("event has ended".to_string()));
    }
    let text = payload.text.trim();
    if text.is_empty() {
        return Err(Error::BadRequest("message text is empty".to_string()));
    }
    let user = match payload.user.trim() {
        "" => "anonymous",
        user => user,
    };
    let message = state.chat.append(&id, user, text).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn chat_purge_handler(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>> {
    state.require_event(&id).await?;
    let removed = state.chat.purge(&id).await?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

async fn chat_sse_handler(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>>> {
    state.require_event(&id).await?;
    debug!("SSE chat subscriber for event {}", id);
    let messages = BroadcastStream::new(state.chat.listen(&id)).filter_map(|message| async move {
        match message {
            Ok(message) => Some(Ok::<_, Infallible>(
                SseEvent::default()
                    .event("message")
                    .data(serde_json::to_string(&message).unwrap_or_default()),
            )),
            Err(e) => {
                debug!("Chat subscriber fell behind: {}", e);
                None
            }
        }
    });
    Ok(Sse::new(messages).keep_alive(KeepAlive::default()))
}

async fn presence_sse_handler(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>>> {
    state.require_event(&id).await?;
    debug!("SSE presence subscriber for event {}", id);
    let counts = WatchStream::new(state.presence.subscribe(&id)).map(|online| {
        let payload = PresenceOutgoing::Count { online };
        Ok(SseEvent::default()
            .event("count")
            .data(serde_json::to_string(&payload).unwrap_or_default()))
    });
    Ok(Sse::new(counts).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum PresenceIncoming {
    Join {
        #[serde(rename = "clientId", default)]
        client_id: Option<String>,
    },
    Heartbeat,
    Leave,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum PresenceOutgoing {
    Joined {
        #[serde(rename = "clientId")]
        client_id: ClientId,
    },
    Count {
        online: usize,
    },
}

async fn presence_ws_handler(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Response> {
    state.require_event(&id).await?;
    Ok(ws.on_upgrade(move |socket| handle_presence_socket(socket, id, state)))
}

async fn send_json(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    payload: &PresenceOutgoing,
) -> bool {
    match serde_json::to_string(payload) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!("Failed to encode presence message: {}", e);
            true
        }
    }
}

/// One presence connection. The entry lives exactly as long as this task
/// holds its guard, so close, error and heartbeat timeout all count as
/// leaving.
async fn handle_presence_socket(socket: WebSocket, event_id: String, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut counts = state.presence.subscribe(&event_id);
    let mut guard: Option<PresenceGuard> = None;
    let timeout = state.presence.heartbeat_timeout();
    let mut last_activity = Instant::now();

    let initial = PresenceOutgoing::Count {
        online: *counts.borrow_and_update(),
    };
    if !send_json(&mut sender, &initial).await {
        return;
    }

    let mut heartbeat_check = tokio::time::interval((timeout / 2).max(Duration::from_secs(1)));
    heartbeat_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = receiver.next() => {
                last_activity = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<PresenceIncoming>(&text) {
                        Ok(PresenceIncoming::Join { client_id }) => {
                            let client_id = client_id
                                .filter(|id| !id.trim().is_empty())
                                .map(ClientId::from)
                                .unwrap_or_else(ClientId::random);
                            let joined = PresenceOutgoing::Joined { client_id: client_id.clone() };
                            guard = Some(state.presence.join(&event_id, client_id));
                            if !send_json(&mut sender, &joined).await {
                                break;
                            }
                        }
                        Ok(PresenceIncoming::Heartbeat) => {
                            if let Some(guard) = &guard {
                                guard.heartbeat();
                            }
                        }
                        Ok(PresenceIncoming::Leave) => {
                            if let Some(guard) = guard.take() {
                                guard.leave();
                            }
                        }
                        Err(e) => debug!("Ignoring presence message on event {}: {}", event_id, e),
                    },
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
            Ok(()) = counts.changed() => {
                let online = *counts.borrow_and_update();
                if !send_json(&mut sender, &PresenceOutgoing::Count { online }).await {
                    break;
                }
            }
            _ = heartbeat_check.tick() => {
                if last_activity.elapsed() > timeout {
                    warn!("Presence socket for event {} timed out", event_id);
                    break;
                }
            }
        }
    }

    if let Some(guard) = guard {
        info!(
            "Presence connection closed: event={} client={}",
            guard.event_id(),
            guard.client_id()
        );
    }
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn js_string(input: &str) -> String {
    serde_json::to_string(input).unwrap_or_else(|_| "\"\"".to_string())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Result<Html<String>> {
    let events = state.events.events().await?;

    let mut cards = String::new();
    for event in events {
        let view = state.view(event).await;
        let status = match view.schedule {
            Schedule::Countdown { remaining } => format!("Starts in {}", remaining),
            Schedule::Live { .. } => "Live now".to_string(),
            Schedule::Ended => "Ended".to_string(),
        };
        cards.push_str(&format!(
            r#"<a href="/watch/{id}" class="card" data-event="{id}">
                <div class="card-name">{title}</div>
                <div class="card-start">{start}</div>
                <div class="card-status">{status}</div>
                <div class="card-online"><span class="online">{online}</span> watching</div>
            </a>"#,
            id = escape_html(&view.id),
            title = escape_html(&view.title),
            start = view.start.format("%Y-%m-%d %H:%M UTC"),
            status = status,
            online = view.online,
        ));
    }
    if cards.is_empty() {
        cards.push_str(r#"<p class="empty">No events scheduled.</p>"#);
    }

    Ok(Html(INDEX_PAGE.replace("__CARDS__", &cards)))
}

async fn watch_handler(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let event = match state.events.event(&id).await {
        Ok(Some(event)) => event,
        Ok(None) => {
            return (StatusCode::NOT_FOUND, Html(NOT_FOUND_PAGE.to_string())).into_response();
        }
        Err(e) => return e.into_response(),
    };

    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("<none>");
    info!("HTTP watch request: id={} UA=\"{}\"", id, user_agent);

    let view = state.view(event).await;
    let duration = view
        .duration
        .map(|d| d.to_string())
        .unwrap_or_else(|| "null".to_string());
    let sync = serde_json::to_string(&state.sync).unwrap_or_else(|_| "{}".to_string());

    let html = WATCH_PAGE
        .replace("__TITLE__", &escape_html(&view.title))
        .replace("__EVENT_ID__", &js_string(&view.id))
        .replace("__START_MS__", &view.start.timestamp_millis().to_string())
        .replace("__MEDIA__", &js_string(&view.media))
        .replace("__DURATION__", &duration)
        .replace("__SYNC__", &sync);
    Html(html).into_response()
}

const NOT_FOUND_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="UTF-8"><title>Not found</title></head>
<body style="background:#0d0d0d;color:#fff;font-family:sans-serif;text-align:center;padding-top:20vh">
    <h1>Event not found</h1>
    <p><a href="/" style="color:#3b82f6">Back to all events</a></p>
</body>
</html>
"#;

const INDEX_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Events</title>
    <style>
        body {
            font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, sans-serif;
            margin: 0; padding: 20px; background: #0d0d0d; color: #fff;
        }
        header { padding: 10px 0 30px; text-align: center; }
        h1 { font-size: 2rem; margin: 0; }
        .grid {
            display: grid; grid-template-columns: repeat(auto-fill, minmax(220px, 1fr));
            gap: 16px; max-width: 1200px; margin: 0 auto;
        }
        .card {
            background: #1a1a1a; padding: 20px; border-radius: 12px; text-decoration: none;
            color: #fff; border: 1px solid rgba(255,255,255,0.05);
        }
        .card:hover { background: #252525; }
        .card-name { font-weight: 600; font-size: 1.1rem; margin-bottom: 8px; }
        .card-start, .card-status, .card-online { color: #a0a0a0; font-size: 0.9rem; }
        .empty { text-align: center; color: #a0a0a0; }
    </style>
</head>
<body>
    <header><h1>Events</h1></header>
    <div class="grid">
        __CARDS__
    </div>
    <script>
        document.querySelectorAll('.card[data-event]').forEach(card => {
            const id = card.dataset.event;
            const online = card.querySelector('.online');
            const source = new EventSource('/api/events/' + encodeURIComponent(id) + '/presence/stream');
            source.addEventListener('count', e => {
                try { online.textContent = JSON.parse(e.data).online; } catch (_) {}
            });
        });
    </script>
</body>
</html>
"#;

const WATCH_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>__TITLE__</title>
    <style>
        body {
            margin: 0; background: #000; color: #fff; height: 100vh;
            font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, sans-serif;
            display: flex; flex-direction: column;
        }
        .header { padding: 15px 20px; display: flex; justify-content: space-between; align-items: center; }
        .header a { color: #ddd; text-decoration: none; }
        .main { flex: 1; display: flex; min-height: 0; }
        .video-wrapper { flex: 1; position: relative; display: flex; align-items: center; justify-content: center; }
        video { width: 100%; max-height: 100%; }
        .overlay {
            position: absolute; inset: 0; background: rgba(0,0,0,0.8);
            display: flex; flex-direction: column; align-items: center; justify-content: center;
        }
        .overlay .big { font-size: 2.5rem; font-variant-numeric: tabular-nums; }
        .chat { width: 300px; display: flex; flex-direction: column; background: #111; }
        .chat ul { flex: 1; overflow-y: auto; list-style: none; margin: 0; padding: 10px; }
        .chat li { margin-bottom: 6px; font-size: 0.9rem; }
        .chat li b { color: #3b82f6; }
        .chat form { display: flex; padding: 10px; gap: 6px; }
        .chat input { flex: 1; background: #222; color: #fff; border: 0; padding: 6px; }
        .hidden { display: none; }
    </style>
    <script src="https://cdn.jsdelivr.net/npm/hls.js@1"></script>
</head>
<body>
    <div class="header">
        <a href="/">&larr; Events</a>
        <div>__TITLE__</div>
        <div><span id="online">0</span> watching</div>
    </div>
    <div class="main">
        <div class="video-wrapper">
            <video id="player" playsinline muted></video>
            <div id="overlay" class="overlay">
                <div id="overlay-label">Loading...</div>
                <div id="overlay-big" class="big"></div>
            </div>
        </div>
        <div class="chat">
            <ul id="chat-messages"></ul>
            <form id="chat-form">
                <input id="chat-text" autocomplete="off" placeholder="Say something">
            </form>
        </div>
    </div>
    <script>
        const eventId = __EVENT_ID__;
        const startMs = __START_MS__;
        const mediaUrl = __MEDIA__;
        let knownDuration = __DURATION__;
        const sync = __SYNC__;
        const chatUrl = '/api/events/' + encodeURIComponent(eventId) + '/chat';
        const player = document.getElementById('player');
        const overlay = document.getElementById('overlay');
        const label = document.getElementById('overlay-label');
        const big = document.getElementById('overlay-big');
        const chatList = document.getElementById('chat-messages');

        let phase = 'loading';
        let hls = null;
        let converging = false;
        let converged = false;

        function show(text, detail) {
            label.textContent = text;
            big.textContent = detail || '';
            overlay.classList.remove('hidden');
        }
        function hide() { overlay.classList.add('hidden'); }
        function elapsed() { return (Date.now() - startMs) / 1000; }
        function pad(n) { return String(n).padStart(2, '0'); }
        function remainingText(ms) {
            let s = Math.max(0, Math.floor(ms / 1000));
            const d = Math.floor(s / 86400); s %= 86400;
            const h = Math.floor(s / 3600); s %= 3600;
            const m = Math.floor(s / 60); s %= 60;
            if (d > 0) return d + 'd ' + pad(h) + ':' + pad(m) + ':' + pad(s);
            if (h > 0) return pad(h) + ':' + pad(m) + ':' + pad(s);
            return pad(m) + ':' + pad(s);
        }

        function enterEnded() {
            if (phase === 'ended' || phase === 'error') return;
            phase = 'ended';
            clearInterval(ticker);
            if (hls) { hls.destroy(); hls = null; }
            player.pause();
            show('This event has ended');
            chatList.innerHTML = '';
            fetch(chatUrl, { method: 'DELETE', keepalive: true }).catch(() => {});
        }
        function enterError(text) {
            if (phase === 'ended' || phase === 'error') return;
            phase = 'error';
            clearInterval(ticker);
            if (hls) { hls.destroy(); hls = null; }
            show(text);
        }

        function isOver(duration) {
            const e = elapsed();
            if (duration) return e >= duration;
            return e > sync.unknown_duration_ceiling_secs;
        }

        function enterLive() {
            if (phase === 'live') return;
            if (!mediaUrl) { enterError('This event has no video configured.'); return; }
            if (window.Hls && Hls.isSupported()) {
                phase = 'live';
                show('Connecting...');
                hls = new Hls();
                hls.on(Hls.Events.MEDIA_ATTACHED, () => hls.loadSource(mediaUrl));
                hls.on(Hls.Events.ERROR, (_, data) => {
                    if (data.fatal) enterError('Stream connection failed. Please try again.');
                });
                hls.attachMedia(player);
            } else if (player.canPlayType('application/vnd.apple.mpegurl')) {
                phase = 'live';
                show('Connecting...');
                player.src = mediaUrl;
            } else {
                enterError('Live streaming is not supported on this device.');
            }
        }

        async function release() {
            converged = true;
            player.muted = true;
            try { await player.play(); hide(); } catch (_) { show('Tap to play'); }
        }

        function isBuffered(position) {
            for (let i = 0; i < player.buffered.length; i++) {
                if (player.buffered.start(i) <= position && position <= player.buffered.end(i)) return true;
            }
            return false;
        }

        async function converge() {
            if (converging || converged || phase !== 'live') return;
            const duration = Number.isFinite(player.duration) ? player.duration : knownDuration;
            if (elapsed() < 0) { player.currentTime = 0; await release(); return; }
            if (!duration) return;
            converging = true;
            let target = elapsed();
            if (target >= duration) { player.currentTime = duration; enterEnded(); return; }
            for (let attempt = 1; attempt <= sync.max_seek_attempts; attempt++) {
                if (sync.require_buffered && !isBuffered(target)) break;
                player.currentTime = target;
                await new Promise(r => setTimeout(r, sync.settle_delay_ms));
                target = elapsed();
                if (Math.abs(player.currentTime - target) <= sync.tolerance_secs) { await release(); return; }
                if (target >= duration) { enterEnded(); return; }
            }
            player.currentTime = 0;
            await release();
        }

        player.addEventListener('loadedmetadata', converge);
        player.addEventListener('canplay', converge);
        player.addEventListener('ended', enterEnded);
        player.addEventListener('timeupdate', () => {
            if (phase === 'live' && !player.paused && player.currentTime > 0
                && player.duration - player.currentTime < sync.end_watchdog_margin_secs) {
                enterEnded();
            }
        });
        player.addEventListener('error', () => {
            if (!hls) enterError('Stream connection failed. Please try again.');
        });
        overlay.addEventListener('click', async () => {
            if (phase !== 'live' || !converged) return;
            player.muted = false;
            try { await player.play(); hide(); } catch (_) {}
        });

        function tick() {
            if (phase === 'ended' || phase === 'error') return;
            const untilStart = startMs - Date.now();
            if (untilStart > 0 && phase !== 'live') {
                phase = 'countdown';
                show('Starts in', remainingText(untilStart));
                return;
            }
            if (phase === 'live') {
                const duration = Number.isFinite(player.duration) ? player.duration : knownDuration;
                if (isOver(duration)) enterEnded();
                return;
            }
            if (isOver(knownDuration)) { enterEnded(); return; }
            enterLive();
        }
        const ticker = setInterval(tick, sync.tick_interval_ms);
        tick();

        (function chat() {
            function append(message) {
                const item = document.createElement('li');
                const user = document.createElement('b');
                user.textContent = message.user + ' ';
                item.appendChild(user);
                item.appendChild(document.createTextNode(message.text));
                chatList.appendChild(item);
                chatList.scrollTop = chatList.scrollHeight;
            }
            fetch(chatUrl).then(r => r.ok ? r.json() : []).then(messages => messages.forEach(append));
            const stream = new EventSource(chatUrl + '/stream');
            stream.addEventListener('message', e => {
                if (phase === 'ended') return;
                try { append(JSON.parse(e.data)); } catch (_) {}
            });
            document.getElementById('chat-form').addEventListener('submit', e => {
                e.preventDefault();
                const input = document.getElementById('chat-text');
                const text = input.value.trim();
                if (!text || phase === 'ended') return;
                input.value = '';
                fetch(chatUrl, {
                    method: 'POST',
                    headers: { 'Content-Type': 'application/json' },
                    body: JSON.stringify({ user: sessionStorage.getItem('chat-user') || '', text }),
                });
            });
        })();

        (function presence() {
            let clientId = sessionStorage.getItem('presence-client-id');
            const proto = location.protocol === 'https:' ? 'wss://' : 'ws://';
            const url = proto + location.host + '/api/events/' + encodeURIComponent(eventId) + '/presence';
            const online = document.getElementById('online');
            let socket = null;
            let beat = null;
            let leaving = false;
            function connect() {
                const ws = new WebSocket(url);
                socket = ws;
                ws.onopen = () => {
                    ws.send(JSON.stringify({ type: 'join', clientId }));
                    beat = setInterval(() => ws.send(JSON.stringify({ type: 'heartbeat' })), 10000);
                };
                ws.onmessage = (msg) => {
                    const data = JSON.parse(msg.data);
                    if (data.type === 'count') online.textContent = data.online;
                    if (data.type === 'joined') {
                        clientId = data.clientId;
                        sessionStorage.setItem('presence-client-id', clientId);
                    }
                };
                ws.onclose = () => {
                    clearInterval(beat);
                    if (!leaving) setTimeout(connect, 3000);
                };
            }
            window.addEventListener('pagehide', () => {
                leaving = true;
                clearInterval(beat);
                if (socket && socket.readyState === WebSocket.OPEN) {
                    socket.send(JSON.stringify({ type: 'leave' }));
                    socket.close();
                }
            });
            connect();
        })();
    </script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<b>"Tom" & 'Jerry'</b>"#),
            "&lt;b&gt;&quot;Tom&quot; &amp; &#39;Jerry&#39;&lt;/b&gt;"
        );
    }

    #[test]
    fn test_presence_messages() {
        let join: PresenceIncoming =
            serde_json::from_str(r#"{"type":"join","clientId":"abc"}"#).unwrap();
        assert!(matches!(join, PresenceIncoming::Join { client_id: Some(ref id) } if id == "abc"));
        let anonymous: PresenceIncoming = serde_json::from_str(r#"{"type":"join"}"#).unwrap();
        assert!(matches!(anonymous, PresenceIncoming::Join { client_id: None }));
        assert!(matches!(
            serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap(),
            PresenceIncoming::Heartbeat
        ));
        assert!(matches!(
            serde_json::from_str(r#"{"type":"leave"}"#).unwrap(),
            PresenceIncoming::Leave
        ));

        let count = serde_json::to_string(&PresenceOutgoing::Count { online: 3 }).unwrap();
        assert_eq!(count, r#"{"type":"count","online":3}"#);
    }
}
