use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use pseudolive::clock::MonotonicClock;
use pseudolive::convergence::Outcome;
use pseudolive::driver::{DriverHandle, SessionDriver};
use pseudolive::media::sim::{SimConfig, SimulatedHandle, SimulatedMedia};
use pseudolive::media::{BufferedRange, Capability, MediaError};
use pseudolive::presence::PresenceRegistry;
use pseudolive::session::{Failure, Phase, PlaybackSession, SessionSnapshot, SyncConfig};
use pseudolive::store::{ChatStore, MemoryChatStore, ScheduledEvent};
use tokio::task::JoinHandle;

fn wall() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 7, 3, 15, 0, 0).unwrap()
}

struct Run {
    handle: DriverHandle,
    media: SimulatedHandle,
    chat: Arc<MemoryChatStore>,
    presence: PresenceRegistry,
    task: JoinHandle<SessionSnapshot>,
}

impl Run {
    async fn wait_for(&self, what: impl FnMut(&SessionSnapshot) -> bool) -> SessionSnapshot {
        let mut snapshots = self.handle.snapshots();
        let snapshot = snapshots
            .wait_for(what)
            .await
            .expect("driver stopped before the condition held")
            .clone();
        snapshot
    }

    async fn finish(self) -> SessionSnapshot {
        self.task.await.unwrap()
    }
}

/// Start a session for an event that began `offset` seconds before now.
async fn launch(offset: i64, config: SimConfig, known_duration: Option<f64>) -> Run {
    launch_with(offset, config, known_duration, SyncConfig::default()).await
}

async fn launch_with(
    offset: i64,
    config: SimConfig,
    known_duration: Option<f64>,
    sync: SyncConfig,
) -> Run {
    let event = ScheduledEvent {
        id: "ev-1".to_string(),
        title: "Sandmeyer Reaction".to_string(),
        start: wall() - chrono::Duration::seconds(offset),
        media: "https://cdn.example/ev-1/playlist.m3u8".to_string(),
    };
    let chat = Arc::new(MemoryChatStore::new());
    chat.append("ev-1", "ada", "see you all there").await.unwrap();
    let presence = PresenceRegistry::new(Duration::from_secs(30));

    let (media, media_events) = SimulatedMedia::new(config);
    let media_handle = media.handle();
    let clock = Arc::new(MonotonicClock::starting_at(wall()));
    let session = PlaybackSession::new(event, media, clock, &sync).with_known_duration(known_duration);
    let (driver, handle) = SessionDriver::new(session, media_events, sync.tick_interval());
    let driver = driver
        .with_chat(chat.clone())
        .with_presence(presence.join("ev-1", "viewer-1".into()));

    Run {
        handle,
        media: media_handle,
        chat,
        presence,
        task: tokio::spawn(driver.run()),
    }
}

/// Let spawned cleanup tasks run.
async fn settle_tasks() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn test_join_while_live_seeks_to_wall_clock_offset() {
    let run = launch(100, SimConfig::default(), None).await;
    let snapshot = run.wait_for(|s| s.converged).await;

    assert_eq!(snapshot.phase, Phase::Live);
    assert_eq!(snapshot.seek_attempts, 1);
    assert_eq!(snapshot.target_offset, Some(100.0));
    assert!(snapshot.muted);
    assert_eq!(run.media.seeks(), vec![100.0]);
    assert!(run.media.is_playing());
    assert!(run.media.is_muted());
    assert_eq!(run.presence.count("ev-1"), 1);

    run.handle.cancel();
    let media = run.media.clone();
    let presence = run.presence.clone();
    let last = run.finish().await;
    assert_eq!(last.phase, Phase::Live);
    assert!(media.is_destroyed());
    assert_eq!(presence.count("ev-1"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_countdown_then_live_at_start() {
    let run = launch(-30, SimConfig::default(), None).await;
    let snapshot = run.wait_for(|s| s.phase == Phase::Countdown).await;
    assert!(snapshot.remaining.unwrap().total_seconds() <= 30);
    assert!(snapshot.target_offset.is_none());
    assert!(run.media.source().is_none());

    let snapshot = run.wait_for(|s| s.phase == Phase::Live).await;
    assert!(snapshot.remaining.is_none());
    let snapshot = run.wait_for(|s| s.converged).await;
    assert!(snapshot.target_offset.unwrap() < 1.0);
    assert!(run.media.seeks()[0] < 1.0);
    run.handle.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_known_duration_past_end_ends_without_seeking() {
    let run = launch(4000, SimConfig::default(), Some(3600.0)).await;
    let media = run.media.clone();
    let chat = run.chat.clone();
    let presence = run.presence.clone();
    let last = run.finish().await;

    assert_eq!(last.phase, Phase::Ended);
    assert_eq!(last.seek_attempts, 0);
    assert!(media.seeks().is_empty());
    assert!(media.source().is_none());
    assert_eq!(presence.count("ev-1"), 0);

    settle_tasks().await;
    assert!(chat.messages("ev-1").await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_duration_learned_from_media_ends_past_end() {
    let run = launch(4000, SimConfig::default(), None).await;
    let media = run.media.clone();
    let last = run.finish().await;

    assert_eq!(last.phase, Phase::Ended);
    assert_eq!(last.seek_attempts, 0);
    assert_eq!(last.outcome, Some(Outcome::PastEnd { duration: 3600.0 }));
    assert_eq!(last.target_offset, Some(3600.0));
    assert!(!media.is_playing());
}

#[tokio::test(start_paused = true)]
async fn test_seek_retries_are_bounded() {
    let config = SimConfig {
        seekable_end: Some(10.0),
        ..SimConfig::default()
    };
    let run = launch(1800, config, None).await;
    let snapshot = run.wait_for(|s| s.converged).await;

    assert_eq!(snapshot.seek_attempts, 3);
    assert_eq!(snapshot.outcome, Some(Outcome::FellBack { attempts: 3 }));
    assert_eq!(snapshot.target_offset, Some(0.0));
    let seeks = run.media.seeks();
    assert_eq!(seeks.len(), 4);
    assert_eq!(seeks.last(), Some(&0.0));
    assert!(run.media.is_playing());
    run.handle.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_buffered_policy_starts_unbuffered_target_from_zero() {
    let sync = SyncConfig {
        require_buffered: true,
        ..SyncConfig::default()
    };
    let config = SimConfig {
        buffered: Some(vec![BufferedRange { start: 0.0, end: 30.0 }]),
        ..SimConfig::default()
    };
    let run = launch_with(600, config, None, sync).await;
    let snapshot = run.wait_for(|s| s.converged).await;

    assert_eq!(snapshot.phase, Phase::Live);
    assert_eq!(snapshot.seek_attempts, 1);
    assert!(matches!(snapshot.outcome, Some(Outcome::Unbuffered { target }) if target >= 600.0));
    assert_eq!(snapshot.target_offset, Some(0.0));
    assert_eq!(run.media.seeks(), vec![0.0]);
    assert!(run.media.is_playing());
    run.handle.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_buffered_policy_seeks_when_target_is_buffered() {
    let sync = SyncConfig {
        require_buffered: true,
        ..SyncConfig::default()
    };
    let config = SimConfig {
        buffered: Some(vec![
            BufferedRange { start: 0.0, end: 30.0 },
            BufferedRange { start: 590.0, end: 700.0 },
        ]),
        ..SimConfig::default()
    };
    let run = launch_with(600, config, None, sync).await;
    let snapshot = run.wait_for(|s| s.converged).await;

    assert!(matches!(snapshot.outcome, Some(Outcome::OnTarget { attempts: 1, .. })));
    assert_eq!(snapshot.target_offset, Some(600.0));
    assert_eq!(run.media.seeks(), vec![600.0]);
    run.handle.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_imprecise_seek_converges_on_retry() {
    let config = SimConfig {
        seek_drift: vec![-40.0],
        ..SimConfig::default()
    };
    let run = launch(600, config, None).await;
    let snapshot = run.wait_for(|s| s.converged).await;

    assert_eq!(snapshot.seek_attempts, 2);
    assert!(matches!(snapshot.outcome, Some(Outcome::OnTarget { attempts: 2, .. })));
    assert_eq!(run.media.seeks().len(), 2);
    run.handle.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_fatal_media_error_is_terminal() {
    let config = SimConfig {
        load_error: Some(MediaError {
            fatal: true,
            detail: "manifest request failed".to_string(),
        }),
        ..SimConfig::default()
    };
    let run = launch(100, config, None).await;
    let media = run.media.clone();
    let chat = run.chat.clone();
    let last = run.finish().await;

    assert_eq!(last.phase, Phase::Error);
    assert_eq!(
        last.failure,
        Some(Failure::Media("manifest request failed".to_string()))
    );
    assert!(media.is_destroyed());
    // chat is only cleaned up when an event ends
    settle_tasks().await;
    assert_eq!(chat.messages("ev-1").await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unsupported_platform() {
    let config = SimConfig {
        capability: Capability::Unsupported,
        ..SimConfig::default()
    };
    let last = launch(100, config, None).await.finish().await;
    assert_eq!(last.phase, Phase::Error);
    assert_eq!(last.failure, Some(Failure::Unsupported));
}

#[tokio::test(start_paused = true)]
async fn test_native_playback_path() {
    let config = SimConfig {
        capability: Capability::Native,
        ..SimConfig::default()
    };
    let run = launch(250, config, None).await;
    let snapshot = run.wait_for(|s| s.converged).await;
    assert_eq!(snapshot.target_offset, Some(250.0));
    assert_eq!(
        run.media.source().as_deref(),
        Some("https://cdn.example/ev-1/playlist.m3u8")
    );
    run.handle.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_media_end_signal_ends_session_and_purges_chat() {
    let run = launch(100, SimConfig::default(), None).await;
    run.wait_for(|s| s.converged).await;
    run.media.finish();

    let chat = run.chat.clone();
    let presence = run.presence.clone();
    let last = run.finish().await;
    assert_eq!(last.phase, Phase::Ended);
    assert_eq!(presence.count("ev-1"), 0);

    settle_tasks().await;
    assert!(chat.messages("ev-1").await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_playback_reaching_end_ends_session() {
    let run = launch(3590, SimConfig::default(), None).await;
    run.wait_for(|s| s.converged).await;
    let last = run.finish().await;
    assert_eq!(last.phase, Phase::Ended);
}

#[tokio::test(start_paused = true)]
async fn test_unmute_gesture() {
    let run = launch(100, SimConfig::default(), None).await;
    run.wait_for(|s| s.converged).await;
    run.handle.unmute();
    let snapshot = run.wait_for(|s| !s.muted).await;
    assert_eq!(snapshot.phase, Phase::Live);
    assert!(!run.media.is_muted());
    assert!(run.media.is_playing());
    run.handle.cancel();
}
