//! Runs a [`PlaybackSession`] on tokio: the 1 Hz ticker, the settle timer,
//! media notifications and user gestures all funnel into one select loop.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::media::{MediaEngine, MediaEvent};
use crate::presence::PresenceGuard;
use crate::session::{Command, PlaybackSession, SessionEvent, SessionSnapshot};
use crate::store::ChatStore;

/// Control surface for a running driver.
#[derive(Clone)]
pub struct DriverHandle {
    cancel: CancellationToken,
    gestures: mpsc::UnboundedSender<()>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl DriverHandle {
    /// Stop the session. The driver tears the media engine down on its way out.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Forward a user gesture that allows sound.
    pub fn unmute(&self) {
        let _ = self.gestures.send(());
    }

    pub fn snapshots(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }
}

pub struct SessionDriver<M> {
    session: PlaybackSession<M>,
    media_events: mpsc::UnboundedReceiver<MediaEvent>,
    gestures: mpsc::UnboundedReceiver<()>,
    cancel: CancellationToken,
    snapshots: watch::Sender<SessionSnapshot>,
    tick_interval: std::time::Duration,
    chat: Option<Arc<dyn ChatStore>>,
    presence: Option<PresenceGuard>,
}

impl<M: MediaEngine> SessionDriver<M> {
    pub fn new(
        session: PlaybackSession<M>,
        media_events: mpsc::UnboundedReceiver<MediaEvent>,
        tick_interval: std::time::Duration,
    ) -> (Self, DriverHandle) {
        let cancel = CancellationToken::new();
        let (gesture_tx, gesture_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot());
        let driver = Self {
            session,
            media_events,
            gestures: gesture_rx,
            cancel: cancel.clone(),
            snapshots: snapshot_tx,
            tick_interval,
            chat: None,
            presence: None,
        };
        let handle = DriverHandle {
            cancel,
            gestures: gesture_tx,
            snapshots: snapshot_rx,
        };
        (driver, handle)
    }

    /// Chat store purged when the event ends.
    pub fn with_chat(mut self, chat: Arc<dyn ChatStore>) -> Self {
        self.chat = Some(chat);
        self
    }

    /// Presence held for as long as the session runs.
    pub fn with_presence(mut self, guard: PresenceGuard) -> Self {
        self.presence = Some(guard);
        self
    }

    /// Drive the session until it reaches a terminal phase or is cancelled.
    /// Returns the final snapshot.
    pub async fn run(mut self) -> SessionSnapshot {
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately; start() already evaluated
        ticker.tick().await;

        let mut timers = Timers {
            ticking: true,
            settle_at: None,
        };

        let commands = self.session.start();
        self.apply(commands, &mut timers);
        self.publish();

        loop {
            if self.session.phase().is_terminal() {
                break;
            }

            let settle_at = timers.settle_at;
            let commands = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Session for event {} cancelled", self.session.event().id);
                    break;
                }
                _ = ticker.tick(), if timers.ticking => {
                    self.session.handle(SessionEvent::Tick)
                }
                Some(event) = self.media_events.recv() => {
                    self.session.handle_media(event)
                }
                Some(()) = self.gestures.recv() => {
                    self.session.handle(SessionEvent::Unmute)
                }
                _ = sleep_until(settle_at.unwrap_or_else(Instant::now)), if settle_at.is_some() => {
                    timers.settle_at = None;
                    self.session.handle(SessionEvent::SettleElapsed)
                }
                else => break,
            };
            self.apply(commands, &mut timers);
            self.publish();
        }

        let commands = self.session.teardown();
        self.apply(commands, &mut timers);
        if let Some(guard) = self.presence.take() {
            guard.leave();
        }
        self.publish();
        self.session.snapshot()
    }

    fn apply(&self, commands: Vec<Command>, timers: &mut Timers) {
        for command in commands {
            debug!("Event {}: {:?}", self.session.event().id, command);
            match command {
                Command::ScheduleSettle(delay) => timers.settle_at = Some(Instant::now() + delay),
                Command::CancelSettle => timers.settle_at = None,
                Command::StopTicker => timers.ticking = false,
                Command::PurgeChat(event_id) => self.purge_chat(event_id),
            }
        }
    }

    fn purge_chat(&self, event_id: String) {
        let Some(chat) = self.chat.clone() else {
            return;
        };
        tokio::spawn(async move {
            match chat.purge(&event_id).await {
                Ok(removed) => debug!("Chat cleanup of event {} removed {}", event_id, removed),
                Err(e) => warn!("Failed to purge chat of event {}: {}", event_id, e),
            }
        });
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.session.snapshot());
    }
}

struct Timers {
    ticking: bool,
    settle_at: Option<Instant>,
}
