//! One viewer's playback of one scheduled event.
//!
//! The session is a plain state machine: the driver feeds it named events
//! (`Tick`, media notifications, the settle timer, user gestures) and carries
//! out the [`Command`]s it hands back. Nothing in here sleeps or spawns, so
//! every transition can be exercised synchronously.
//!
//! ```text
//! loading <-> countdown -> live -> ended
//!                            \---> error
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::clock::{elapsed_seconds, Calculator, Clock, Remaining, Schedule};
use crate::convergence::{Controller, ConvergencePolicy, Outcome, Step};
use crate::media::{Capability, MediaEngine, MediaEvent};
use crate::metrics::SESSION_PHASES;
use crate::store::ScheduledEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Loading,
    Countdown,
    Live,
    Ended,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Loading => "loading",
            Phase::Countdown => "countdown",
            Phase::Live => "live",
            Phase::Ended => "ended",
            Phase::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Ended | Phase::Error)
    }

    /// Forward-only, except loading and countdown which may alternate
    /// until the stream goes live.
    pub fn can_transition_to(&self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Loading, Countdown | Live | Ended | Error)
                | (Countdown, Loading | Live | Ended | Error)
                | (Live, Ended | Error)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session landed in [`Phase::Error`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Failure {
    MissingMediaLocator,
    Unsupported,
    Media(String),
}

impl Failure {
    /// Text shown to the viewer. Engine details stay in the logs.
    pub fn user_message(&self) -> &'static str {
        match self {
            Failure::MissingMediaLocator => "This event has no video configured.",
            Failure::Unsupported => "Live streaming is not supported on this device.",
            Failure::Media(_) => "Stream connection failed. Please try again.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionEvent {
    /// Periodic re-evaluation (1 Hz).
    Tick,
    /// The settle delay requested by [`Command::ScheduleSettle`] has passed.
    SettleElapsed,
    /// Explicit user gesture asking for sound.
    Unmute,
}

/// Side effects the session asks its driver to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ScheduleSettle(Duration),
    CancelSettle,
    StopTicker,
    /// Fire-and-forget deletion of the event's chat.
    PurgeChat(String),
}

/// Engine tuning, the `[sync]` section of the configuration. Serialized
/// into each watch page so the browser engine runs the same policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub tolerance_secs: f64,
    pub settle_delay_ms: u64,
    pub max_seek_attempts: u32,
    pub require_buffered: bool,
    /// The end watchdog fires when the playhead is this close to the end.
    pub end_watchdog_margin_secs: f64,
    pub unknown_duration_ceiling_secs: u64,
    pub tick_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let policy = ConvergencePolicy::default();
        Self {
            tolerance_secs: policy.tolerance_secs,
            settle_delay_ms: policy.settle_delay_ms,
            max_seek_attempts: policy.max_seek_attempts,
            require_buffered: policy.require_buffered,
            end_watchdog_margin_secs: 1.0,
            unknown_duration_ceiling_secs: crate::clock::UNKNOWN_DURATION_CEILING.as_secs(),
            tick_interval_ms: 1000,
        }
    }
}

impl SyncConfig {
    pub fn policy(&self) -> ConvergencePolicy {
        ConvergencePolicy {
            tolerance_secs: self.tolerance_secs,
            settle_delay_ms: self.settle_delay_ms,
            max_seek_attempts: self.max_seek_attempts,
            require_buffered: self.require_buffered,
        }
    }

    pub fn calculator(&self) -> Calculator {
        Calculator::new(Duration::from_secs(self.unknown_duration_ceiling_secs))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub event_id: String,
    pub phase: Phase,
    pub remaining: Option<Remaining>,
    pub target_offset: Option<f64>,
    pub media_duration: Option<f64>,
    pub seek_attempts: u32,
    pub converged: bool,
    pub outcome: Option<Outcome>,
    pub muted: bool,
    pub failure: Option<Failure>,
}

pub struct PlaybackSession<M> {
    event: ScheduledEvent,
    media: M,
    clock: Arc<dyn Clock>,
    calculator: Calculator,
    controller: Controller,
    end_margin: f64,
    phase: Phase,
    remaining: Option<Remaining>,
    target_offset: Option<f64>,
    media_duration: Option<f64>,
    known_duration: Option<f64>,
    muted: bool,
    failure: Option<Failure>,
    torn_down: bool,
}

impl<M: MediaEngine> PlaybackSession<M> {
    pub fn new(event: ScheduledEvent, media: M, clock: Arc<dyn Clock>, config: &SyncConfig) -> Self {
        Self {
            event,
            media,
            clock,
            calculator: config.calculator(),
            controller: Controller::new(config.policy()),
            end_margin: config.end_watchdog_margin_secs,
            phase: Phase::Loading,
            remaining: None,
            target_offset: None,
            media_duration: None,
            known_duration: None,
            muted: true,
            failure: None,
            torn_down: false,
        }
    }

    /// Duration learned out of band (e.g. probed from the playlist), used
    /// until the engine reports its own.
    pub fn with_known_duration(mut self, duration: Option<f64>) -> Self {
        self.known_duration = duration;
        self.media_duration = duration;
        self
    }

    pub fn event(&self) -> &ScheduledEvent {
        &self.event
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn media(&self) -> &M {
        &self.media
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            event_id: self.event.id.clone(),
            phase: self.phase,
            remaining: self.remaining,
            target_offset: self.target_offset,
            media_duration: self.media_duration,
            seek_attempts: self.controller.attempts(),
            converged: self.controller.is_converged(),
            outcome: self.controller.outcome(),
            muted: self.muted,
            failure: self.failure.clone(),
        }
    }

    /// Begin (or restart) the session. Nothing carries over from a previous
    /// run.
    pub fn start(&mut self) -> Vec<Command> {
        self.controller.reset();
        self.phase = Phase::Loading;
        self.remaining = None;
        self.target_offset = None;
        self.media_duration = self.known_duration;
        self.failure = None;
        self.torn_down = false;
        self.muted = true;
        self.media.set_muted(true);
        SESSION_PHASES.with_label_values(&[Phase::Loading.as_str()]).inc();

        if self.event.media.trim().is_empty() {
            warn!("Event {} has no media locator", self.event.id);
            return self.fail(Failure::MissingMediaLocator);
        }
        self.evaluate()
    }

    pub fn handle(&mut self, event: SessionEvent) -> Vec<Command> {
        if self.torn_down {
            return Vec::new();
        }
        if self.phase.is_terminal() {
            return match event {
                SessionEvent::Tick => vec![Command::StopTicker],
                _ => Vec::new(),
            };
        }
        match event {
            SessionEvent::Tick => match self.phase {
                Phase::Loading | Phase::Countdown => self.evaluate(),
                Phase::Live => self.check_end(),
                Phase::Ended | Phase::Error => Vec::new(),
            },
            SessionEvent::SettleElapsed => {
                if self.phase != Phase::Live {
                    return Vec::new();
                }
                let elapsed = self.elapsed();
                let step = self.controller.settle(&mut self.media, elapsed);
                self.apply(step)
            }
            SessionEvent::Unmute => {
                self.muted = false;
                self.media.set_muted(false);
                if self.controller.is_converged() && self.media.paused() {
                    if let Err(e) = self.media.play() {
                        debug!("play() after unmute rejected: {}", e);
                    }
                }
                Vec::new()
            }
        }
    }

    pub fn handle_media(&mut self, event: MediaEvent) -> Vec<Command> {
        if self.torn_down || self.phase != Phase::Live {
            debug!("Ignoring {:?} in phase {}", event, self.phase);
            return Vec::new();
        }
        match event {
            MediaEvent::MediaAttached => {
                self.media.load_source(&self.event.media);
                Vec::new()
            }
            MediaEvent::ManifestReady => {
                debug!("Manifest ready for event {}", self.event.id);
                Vec::new()
            }
            MediaEvent::LoadedMetadata | MediaEvent::CanPlay => {
                if let Some(duration) = self.media.duration() {
                    self.media_duration = Some(duration);
                }
                self.try_converge()
            }
            MediaEvent::TimeUpdate => self.check_end(),
            MediaEvent::Ended => {
                info!("Media reported end of playback for event {}", self.event.id);
                self.enter_ended()
            }
            MediaEvent::Error(err) if err.fatal => {
                error!("Event {}: {}", self.event.id, err);
                self.fail(Failure::Media(err.detail))
            }
            MediaEvent::Error(err) => {
                debug!("Event {}: {}", self.event.id, err);
                Vec::new()
            }
        }
    }

    /// Release the media engine. The session ignores everything afterwards.
    pub fn teardown(&mut self) -> Vec<Command> {
        if self.torn_down {
            return Vec::new();
        }
        self.torn_down = true;
        self.media.destroy();
        vec![Command::CancelSettle, Command::StopTicker]
    }

    fn now_schedule(&self) -> Schedule {
        self.calculator
            .classify(self.clock.now(), self.event.start, self.media_duration)
    }

    fn elapsed(&self) -> f64 {
        elapsed_seconds(self.clock.now(), self.event.start)
    }

    fn evaluate(&mut self) -> Vec<Command> {
        match self.now_schedule() {
            Schedule::Countdown { remaining } => {
                self.remaining = Some(remaining);
                self.transition(Phase::Countdown);
                Vec::new()
            }
            Schedule::Live { .. } => self.enter_live(),
            Schedule::Ended => self.enter_ended(),
        }
    }

    fn enter_live(&mut self) -> Vec<Command> {
        let capability = self.media.capability();
        if capability == Capability::Unsupported {
            self.remaining = None;
            return self.fail(Failure::Unsupported);
        }
        if !self.transition(Phase::Live) {
            return Vec::new();
        }
        self.remaining = None;
        match capability {
            Capability::Engine => self.media.attach(),
            _ => self.media.load_source(&self.event.media),
        }
        Vec::new()
    }

    fn try_converge(&mut self) -> Vec<Command> {
        if !self.controller.is_idle() {
            return Vec::new();
        }
        let elapsed = self.elapsed();
        let step = self.controller.begin(&mut self.media, elapsed);
        self.apply(step)
    }

    fn apply(&mut self, step: Step) -> Vec<Command> {
        match step {
            Step::Settle(delay) => {
                self.target_offset = self.controller.target();
                vec![Command::ScheduleSettle(delay)]
            }
            Step::Done(outcome) => {
                self.target_offset = self.controller.target();
                if let Outcome::PastEnd { .. } = outcome {
                    return self.enter_ended();
                }
                Vec::new()
            }
            Step::AwaitDuration | Step::Ignored => Vec::new(),
        }
    }

    /// Calculator and watchdog end detection while live. The engine's own
    /// `Ended` signal is the third path.
    fn check_end(&mut self) -> Vec<Command> {
        if self.now_schedule().is_ended() {
            return self.enter_ended();
        }
        if let Some(duration) = self.media.duration() {
            let position = self.media.current_time();
            if !self.media.paused() && position > 0.0 && duration - position < self.end_margin {
                info!(
                    "Playhead {:.1}s reached end of {:.1}s for event {}",
                    position, duration, self.event.id
                );
                return self.enter_ended();
            }
        }
        Vec::new()
    }

    fn enter_ended(&mut self) -> Vec<Command> {
        if !self.transition(Phase::Ended) {
            return Vec::new();
        }
        self.remaining = None;
        if self.target_offset.is_none() {
            self.target_offset = self.media_duration;
        }
        if !self.media.paused() {
            self.media.pause();
        }
        vec![
            Command::CancelSettle,
            Command::StopTicker,
            Command::PurgeChat(self.event.id.clone()),
        ]
    }

    fn fail(&mut self, failure: Failure) -> Vec<Command> {
        if !self.transition(Phase::Error) {
            return Vec::new();
        }
        self.failure = Some(failure);
        vec![Command::CancelSettle, Command::StopTicker]
    }

    fn transition(&mut self, next: Phase) -> bool {
        if self.phase == next {
            return false;
        }
        if !self.phase.can_transition_to(next) {
            warn!(
                "Refusing phase change {} -> {} for event {}",
                self.phase, next, self.event.id
            );
            return false;
        }
        info!("Event {} session: {} -> {}", self.event.id, self.phase, next);
        SESSION_PHASES.with_label_values(&[next.as_str()]).inc();
        self.phase = next;
        true
    }
}
