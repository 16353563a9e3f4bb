use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::{SinkExt, StreamExt};
use pseudolive::clock::ManualClock;
use pseudolive::presence::PresenceRegistry;
use pseudolive::store::{Catalog, MemoryChatStore, ScheduledEvent};
use pseudolive::{create_app, AppState};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Serve the app on an ephemeral port; returns the presence socket URL.
async fn start(heartbeat_timeout: Duration) -> (String, PresenceRegistry) {
    let now = Utc.with_ymd_and_hms(2025, 7, 3, 15, 0, 0).unwrap();
    let catalog = Catalog::new(vec![ScheduledEvent {
        id: "running".to_string(),
        title: "Sandmeyer Reaction".to_string(),
        start: now - chrono::Duration::minutes(15),
        media: "https://cdn.example/running/playlist.m3u8".to_string(),
    }]);
    let presence = PresenceRegistry::new(heartbeat_timeout);
    let state = AppState::new(
        Arc::new(catalog),
        Arc::new(MemoryChatStore::new()),
        presence.clone(),
    )
    .with_clock(Arc::new(ManualClock::new(now)));
    let app = create_app(state);

    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (format!("ws://{}/api/events/running/presence", addr), presence)
}

async fn connect(url: &str) -> Socket {
    connect_async(url).await.unwrap().0
}

async fn send(socket: &mut Socket, value: Value) {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

/// Next message of type `kind`, skipping anything else.
async fn next_of(socket: &mut Socket, kind: &str) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("no presence message within 5s")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = msg {
            let value: Value = serde_json::from_str(text.as_str()).unwrap();
            if value["type"] == kind {
                return value;
            }
        }
    }
}

/// Skip count updates until one reports `online`.
async fn expect_count(socket: &mut Socket, online: usize) {
    loop {
        if next_of(socket, "count").await["online"] == online {
            return;
        }
    }
}

async fn wait_for_count(presence: &PresenceRegistry, expected: usize) {
    for _ in 0..500 {
        if presence.count("running") == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(presence.count("running"), expected);
}

#[tokio::test]
async fn test_join_rejoin_leave_and_close() {
    let (url, presence) = start(Duration::from_secs(30)).await;

    let mut a = connect(&url).await;
    assert_eq!(next_of(&mut a, "count").await["online"], 0);
    send(&mut a, json!({"type": "join"})).await;
    let joined = next_of(&mut a, "joined").await;
    let assigned = joined["clientId"].as_str().unwrap();
    assert_eq!(assigned.len(), 32);
    expect_count(&mut a, 1).await;

    let mut b = connect(&url).await;
    next_of(&mut b, "count").await;
    send(&mut b, json!({"type": "join", "clientId": "tab-b"})).await;
    assert_eq!(next_of(&mut b, "joined").await["clientId"], "tab-b");
    expect_count(&mut a, 2).await;

    // joining again on the same socket keeps a single entry
    send(&mut b, json!({"type": "join", "clientId": "tab-b"})).await;
    next_of(&mut b, "joined").await;
    send(&mut b, json!({"type": "heartbeat"})).await;
    wait_for_count(&presence, 2).await;
    assert_eq!(presence.entries("running").len(), 2);

    send(&mut b, json!({"type": "leave"})).await;
    expect_count(&mut a, 1).await;

    b.close(None).await.unwrap();
    a.close(None).await.unwrap();
    wait_for_count(&presence, 0).await;
}

#[tokio::test]
async fn test_dropped_connection_counts_as_leaving() {
    let (url, presence) = start(Duration::from_secs(30)).await;

    let mut a = connect(&url).await;
    send(&mut a, json!({"type": "join", "clientId": "tab-a"})).await;
    next_of(&mut a, "joined").await;
    wait_for_count(&presence, 1).await;

    // no close frame, no leave
    drop(a);
    wait_for_count(&presence, 0).await;
}

#[tokio::test]
async fn test_silent_socket_times_out() {
    let (url, presence) = start(Duration::from_secs(1)).await;

    let mut quiet = connect(&url).await;
    send(&mut quiet, json!({"type": "join", "clientId": "quiet"})).await;
    next_of(&mut quiet, "joined").await;

    let mut chatty = connect(&url).await;
    send(&mut chatty, json!({"type": "join", "clientId": "chatty"})).await;
    next_of(&mut chatty, "joined").await;
    wait_for_count(&presence, 2).await;

    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(300)).await;
        send(&mut chatty, json!({"type": "heartbeat"})).await;
    }

    wait_for_count(&presence, 1).await;
    assert_eq!(presence.entries("running")[0].client_id.as_str(), "chatty");

    // the server hung up on the silent client
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match quiet.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());
}
