//! In-process media engine used by `pseudolive simulate` and the tests.
//!
//! Plays a virtual asset against the tokio clock, so paused-time tests see
//! the playhead move exactly as far as time was advanced.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{BufferedRange, Capability, MediaEngine, MediaError, MediaEvent, PlayError};

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub capability: Capability,
    pub duration: f64,
    /// Added to the requested position of successive seeks. Once used up,
    /// seeks land exactly.
    pub seek_drift: Vec<f64>,
    /// Seeks past this position clamp to it.
    pub seekable_end: Option<f64>,
    /// Reported buffered ranges; defaults to the whole asset.
    pub buffered: Option<Vec<BufferedRange>>,
    /// Refuse `play()` while unmuted.
    pub block_unmuted_autoplay: bool,
    /// Raised instead of loading the manifest.
    pub load_error: Option<MediaError>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            capability: Capability::Engine,
            duration: 3600.0,
            seek_drift: Vec::new(),
            seekable_end: None,
            buffered: None,
            block_unmuted_autoplay: true,
            load_error: None,
        }
    }
}

struct SimState {
    config: SimConfig,
    drift: VecDeque<f64>,
    events: mpsc::UnboundedSender<MediaEvent>,
    source: Option<String>,
    metadata_loaded: bool,
    position: f64,
    playing_since: Option<Instant>,
    muted: bool,
    destroyed: bool,
    seeks: Vec<f64>,
}

impl SimState {
    fn emit(&self, event: MediaEvent) {
        if !self.destroyed {
            let _ = self.events.send(event);
        }
    }

    fn position(&self) -> f64 {
        match self.playing_since {
            Some(since) => (self.position + since.elapsed().as_secs_f64()).min(self.config.duration),
            None => self.position,
        }
    }

    fn freeze(&mut self) {
        self.position = self.position();
        if self.playing_since.is_some() {
            self.playing_since = Some(Instant::now());
        }
    }
}

pub struct SimulatedMedia {
    state: Arc<Mutex<SimState>>,
}

/// Test-side view of a [`SimulatedMedia`] that has been moved into a session.
#[derive(Clone)]
pub struct SimulatedHandle {
    state: Arc<Mutex<SimState>>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl SimulatedMedia {
    pub fn new(config: SimConfig) -> (Self, mpsc::UnboundedReceiver<MediaEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = SimState {
            drift: config.seek_drift.iter().copied().collect(),
            config,
            events: tx,
            source: None,
            metadata_loaded: false,
            position: 0.0,
            playing_since: None,
            muted: false,
            destroyed: false,
            seeks: Vec::new(),
        };
        (
            Self {
                state: Arc::new(Mutex::new(state)),
            },
            rx,
        )
    }

    pub fn handle(&self) -> SimulatedHandle {
        SimulatedHandle {
            state: self.state.clone(),
        }
    }
}

impl SimulatedHandle {
    /// Inject an engine event as if the engine raised it.
    pub fn emit(&self, event: MediaEvent) {
        lock(&self.state).emit(event);
    }

    /// Jump to the end of the asset and fire `Ended`.
    pub fn finish(&self) {
        let mut state = lock(&self.state);
        state.position = state.config.duration;
        state.playing_since = None;
        state.emit(MediaEvent::Ended);
    }

    /// Positions requested through `set_current_time`, in order.
    pub fn seeks(&self) -> Vec<f64> {
        lock(&self.state).seeks.clone()
    }

    pub fn position(&self) -> f64 {
        lock(&self.state).position()
    }

    pub fn is_playing(&self) -> bool {
        lock(&self.state).playing_since.is_some()
    }

    pub fn is_muted(&self) -> bool {
        lock(&self.state).muted
    }

    pub fn is_destroyed(&self) -> bool {
        lock(&self.state).destroyed
    }

    pub fn source(&self) -> Option<String> {
        lock(&self.state).source.clone()
    }
}

impl MediaEngine for SimulatedMedia {
    fn capability(&self) -> Capability {
        lock(&self.state).config.capability
    }

    fn attach(&mut self) {
        let state = lock(&self.state);
        if state.config.capability == Capability::Engine {
            state.emit(MediaEvent::MediaAttached);
        }
    }

    fn load_source(&mut self, uri: &str) {
        let mut state = lock(&self.state);
        state.source = Some(uri.to_string());
        if let Some(err) = state.config.load_error.clone() {
            state.emit(MediaEvent::Error(err));
            return;
        }
        if state.config.capability == Capability::Engine {
            state.emit(MediaEvent::ManifestReady);
        }
        state.metadata_loaded = true;
        state.emit(MediaEvent::LoadedMetadata);
        state.emit(MediaEvent::CanPlay);
    }

    fn current_time(&self) -> f64 {
        lock(&self.state).position()
    }

    fn set_current_time(&mut self, seconds: f64) {
        let mut state = lock(&self.state);
        state.freeze();
        state.seeks.push(seconds);
        let drift = state.drift.pop_front().unwrap_or(0.0);
        let limit = state.config.seekable_end.unwrap_or(state.config.duration);
        state.position = (seconds + drift).clamp(0.0, limit.max(0.0));
        state.emit(MediaEvent::CanPlay);
    }

    fn duration(&self) -> Option<f64> {
        let state = lock(&self.state);
        state.metadata_loaded.then_some(state.config.duration)
    }

    fn paused(&self) -> bool {
        lock(&self.state).playing_since.is_none()
    }

    fn play(&mut self) -> Result<(), PlayError> {
        let mut state = lock(&self.state);
        if state.destroyed {
            return Err(PlayError::Failed("engine destroyed".to_string()));
        }
        if state.config.block_unmuted_autoplay && !state.muted {
            return Err(PlayError::Blocked);
        }
        if state.playing_since.is_none() {
            state.playing_since = Some(Instant::now());
        }
        Ok(())
    }

    fn pause(&mut self) {
        let mut state = lock(&self.state);
        state.position = state.position();
        state.playing_since = None;
    }

    fn buffered(&self) -> Vec<BufferedRange> {
        let state = lock(&self.state);
        state.config.buffered.clone().unwrap_or_else(|| {
            vec![BufferedRange {
                start: 0.0,
                end: state.config.duration,
            }]
        })
    }

    fn set_muted(&mut self, muted: bool) {
        lock(&self.state).muted = muted;
    }

    fn destroy(&mut self) {
        let mut state = lock(&self.state);
        state.position = state.position();
        state.playing_since = None;
        state.destroyed = true;
    }
}
