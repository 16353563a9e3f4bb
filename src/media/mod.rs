//! Boundary to the HLS-capable media engine.
//!
//! The engine (an hls.js-like adapter plus the element it drives) is an
//! external collaborator. Sessions only see this trait and the events the
//! engine pushes back through a channel handed out at construction.

pub mod sim;

use std::fmt;

use thiserror::Error;

/// What the platform can play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Full engine: `attach` then `load_source` once `MediaAttached` fires.
    Engine,
    /// No engine, but the element plays HLS itself; `load_source` directly.
    Native,
    Unsupported,
}

/// A contiguous span the engine already holds, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferedRange {
    pub start: f64,
    pub end: f64,
}

impl BufferedRange {
    pub fn contains(&self, position: f64) -> bool {
        self.start <= position && position <= self.end
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaError {
    pub fatal: bool,
    pub detail: String,
}

impl fmt::Display for MediaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.fatal { "fatal" } else { "non-fatal" };
        write!(f, "{kind} media error: {}", self.detail)
    }
}

/// Notifications from the engine and its element.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    MediaAttached,
    ManifestReady,
    LoadedMetadata,
    CanPlay,
    TimeUpdate,
    Ended,
    Error(MediaError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlayError {
    /// Autoplay policy refused to start playback.
    #[error("playback blocked by autoplay policy")]
    Blocked,
    #[error("playback failed: {0}")]
    Failed(String),
}

pub trait MediaEngine: Send {
    fn capability(&self) -> Capability;

    fn attach(&mut self);

    fn load_source(&mut self, uri: &str);

    /// Playhead position in seconds.
    fn current_time(&self) -> f64;

    /// Request a seek. Completion is asynchronous and may land imprecisely.
    fn set_current_time(&mut self, seconds: f64);

    /// `None` until metadata has been loaded.
    fn duration(&self) -> Option<f64>;

    fn paused(&self) -> bool;

    fn play(&mut self) -> Result<(), PlayError>;

    fn pause(&mut self);

    fn buffered(&self) -> Vec<BufferedRange>;

    fn set_muted(&mut self, muted: bool);

    /// Release the engine. No events are delivered afterwards.
    fn destroy(&mut self);
}
