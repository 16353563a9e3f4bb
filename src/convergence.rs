//! Seek convergence: drive the playhead to the wall-clock offset.
//!
//! A single seek is not guaranteed to land where it was asked to (segments
//! not fetched yet, asynchronous completion), so every seek is followed by a
//! settle check and retried a bounded number of times. When retries run out
//! the viewer starts from the beginning instead of waiting forever.
//!
//! Policy: retries are counted; the buffered-range check is an opt-in
//! refinement ([`ConvergencePolicy::require_buffered`]) that sends viewers to
//! position 0 when the target is not buffered yet.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::media::MediaEngine;
use crate::metrics::SEEK_ATTEMPTS;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergencePolicy {
    /// Largest accepted gap between playhead and target, in seconds.
    pub tolerance_secs: f64,
    pub settle_delay_ms: u64,
    pub max_seek_attempts: u32,
    pub require_buffered: bool,
}

impl Default for ConvergencePolicy {
    fn default() -> Self {
        Self {
            tolerance_secs: 5.0,
            settle_delay_ms: 500,
            max_seek_attempts: 3,
            require_buffered: false,
        }
    }
}

impl ConvergencePolicy {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// How a convergence run finished.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// Media was ready before the scheduled start; playing from 0.
    PreRoll,
    OnTarget { offset: f64, attempts: u32 },
    /// Retries exhausted; playing from 0.
    FellBack { attempts: u32 },
    /// Target not buffered; playing from 0.
    Unbuffered { target: f64 },
    /// The asset is over. Parked at its end, paused.
    PastEnd { duration: f64 },
}

/// What the caller has to do next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step {
    /// Duration not known yet; call `begin` again on the next readiness signal.
    AwaitDuration,
    /// Call `settle` after this delay.
    Settle(Duration),
    Done(Outcome),
    /// Not applicable in the current state (already seeking or converged).
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Idle,
    Settling { target: f64 },
    Converged(Outcome),
}

#[derive(Debug, Clone)]
pub struct Controller {
    policy: ConvergencePolicy,
    state: State,
    attempts: u32,
}

impl Controller {
    pub fn new(policy: ConvergencePolicy) -> Self {
        Self {
            policy,
            state: State::Idle,
            attempts: 0,
        }
    }

    pub fn policy(&self) -> &ConvergencePolicy {
        &self.policy
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    pub fn is_settling(&self) -> bool {
        matches!(self.state, State::Settling { .. })
    }

    pub fn is_converged(&self) -> bool {
        matches!(self.state, State::Converged(_))
    }

    pub fn outcome(&self) -> Option<Outcome> {
        match self.state {
            State::Converged(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// Where the playhead is being driven to, once known.
    pub fn target(&self) -> Option<f64> {
        match self.state {
            State::Idle => None,
            State::Settling { target } => Some(target),
            State::Converged(Outcome::PreRoll)
            | State::Converged(Outcome::FellBack { .. })
            | State::Converged(Outcome::Unbuffered { .. }) => Some(0.0),
            State::Converged(Outcome::OnTarget { offset, .. }) => Some(offset),
            State::Converged(Outcome::PastEnd { duration }) => Some(duration),
        }
    }

    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.attempts = 0;
    }

    /// Start converging on `elapsed` once the engine reports it can play.
    pub fn begin<M: MediaEngine + ?Sized>(&mut self, media: &mut M, elapsed: f64) -> Step {
        if self.state != State::Idle {
            return Step::Ignored;
        }
        if elapsed < 0.0 {
            info!("Media ready before scheduled start, pre-rolling from 0");
            media.set_current_time(0.0);
            return self.release(media, Outcome::PreRoll);
        }
        let Some(duration) = media.duration() else {
            return Step::AwaitDuration;
        };
        if elapsed >= duration {
            return self.park_at_end(media, duration);
        }
        self.seek(media, elapsed)
    }

    /// Evaluate the last seek after the settle delay.
    pub fn settle<M: MediaEngine + ?Sized>(&mut self, media: &mut M, elapsed: f64) -> Step {
        if !self.is_settling() {
            return Step::Ignored;
        }
        let actual = media.current_time();
        let gap = (actual - elapsed).abs();
        if gap <= self.policy.tolerance_secs {
            info!(
                "Converged at {:.1}s (target {:.1}s) after {} seek(s)",
                actual, elapsed, self.attempts
            );
            return self.release(
                media,
                Outcome::OnTarget {
                    offset: actual,
                    attempts: self.attempts,
                },
            );
        }
        if let Some(duration) = media.duration() {
            if elapsed >= duration {
                return self.park_at_end(media, duration);
            }
        }
        debug!(
            "Seek landed at {:.1}s, {:.1}s away from {:.1}s (attempt {}/{})",
            actual, gap, elapsed, self.attempts, self.policy.max_seek_attempts
        );
        self.seek(media, elapsed)
    }

    fn seek<M: MediaEngine + ?Sized>(&mut self, media: &mut M, elapsed: f64) -> Step {
        if self.attempts >= self.policy.max_seek_attempts {
            warn!(
                "Seek did not converge after {} attempts, starting from 0",
                self.attempts
            );
            media.set_current_time(0.0);
            return self.release(
                media,
                Outcome::FellBack {
                    attempts: self.attempts,
                },
            );
        }
        self.attempts += 1;
        if self.policy.require_buffered && !media.buffered().iter().any(|r| r.contains(elapsed)) {
            info!("Target {:.1}s not buffered, starting from 0", elapsed);
            media.set_current_time(0.0);
            return self.release(media, Outcome::Unbuffered { target: elapsed });
        }
        media.set_current_time(elapsed);
        self.state = State::Settling { target: elapsed };
        Step::Settle(self.policy.settle_delay())
    }

    fn park_at_end<M: MediaEngine + ?Sized>(&mut self, media: &mut M, duration: f64) -> Step {
        info!("Scheduled offset is past the end of the media ({:.1}s)", duration);
        media.set_current_time(duration);
        media.pause();
        self.finish(Outcome::PastEnd { duration })
    }

    fn release<M: MediaEngine + ?Sized>(&mut self, media: &mut M, outcome: Outcome) -> Step {
        if let Err(e) = media.play() {
            // Leave the viewer muted; the user can start sound with a gesture.
            debug!("play() rejected: {}", e);
            media.set_muted(true);
        }
        self.finish(outcome)
    }

    fn finish(&mut self, outcome: Outcome) -> Step {
        SEEK_ATTEMPTS.observe(self.attempts as f64);
        self.state = State::Converged(outcome);
        Step::Done(outcome)
    }
}
