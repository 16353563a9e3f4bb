//! Wall-clock schedule classification.
//!
//! Everything here is pure except the [`Clock`] implementations. The
//! calculator answers one question: given when a broadcast was scheduled to
//! start, where should a viewer joining *now* be?

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// How long past its start an event with an unknown media duration is still
/// considered live.
pub const UNKNOWN_DURATION_CEILING: Duration = Duration::from_secs(2 * 60 * 60);

/// Source of "now". Sessions never call `Utc::now()` directly so tests can
/// pin or advance time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock sampled once and then advanced by the tokio monotonic clock.
///
/// Immune to wall-clock jumps while a session runs, and follows
/// `tokio::time::pause()`/`advance()` in tests.
pub struct MonotonicClock {
    wall: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            wall,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = self.origin.elapsed();
        self.wall + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Time left until a scheduled start, split into display units.
///
/// `hours` is below 24 here; use [`Remaining::total_hours`] for the
/// hours/minutes/seconds presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Remaining {
    pub days: u64,
    pub hours: u64,
    pub minutes: u64,
    pub seconds: u64,
}

impl Remaining {
    /// Negative spans clamp to zero. Sub-second remainders are dropped.
    pub fn from_millis(millis: i64) -> Self {
        let total = (millis.max(0) as u64) / 1000;
        Self {
            days: total / 86_400,
            hours: (total % 86_400) / 3_600,
            minutes: (total % 3_600) / 60,
            seconds: total % 60,
        }
    }

    pub fn total_seconds(&self) -> u64 {
        self.days * 86_400 + self.hours * 3_600 + self.minutes * 60 + self.seconds
    }

    pub fn total_hours(&self) -> u64 {
        self.days * 24 + self.hours
    }
}

impl fmt::Display for Remaining {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.days > 0 {
            write!(
                f,
                "{}d {:02}:{:02}:{:02}",
                self.days, self.hours, self.minutes, self.seconds
            )
        } else if self.hours > 0 {
            write!(f, "{:02}:{:02}:{:02}", self.hours, self.minutes, self.seconds)
        } else {
            write!(f, "{:02}:{:02}", self.minutes, self.seconds)
        }
    }
}

/// Where an event stands relative to the wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Schedule {
    Countdown { remaining: Remaining },
    Live { elapsed: f64 },
    Ended,
}

impl Schedule {
    pub fn is_live(&self) -> bool {
        matches!(self, Schedule::Live { .. })
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Schedule::Ended)
    }
}

/// Seconds since `start`; negative before it.
pub fn elapsed_seconds(now: DateTime<Utc>, start: DateTime<Utc>) -> f64 {
    (now - start).num_milliseconds() as f64 / 1000.0
}

#[derive(Debug, Clone, Copy)]
pub struct Calculator {
    unknown_duration_ceiling: Duration,
}

impl Default for Calculator {
    fn default() -> Self {
        Self {
            unknown_duration_ceiling: UNKNOWN_DURATION_CEILING,
        }
    }
}

impl Calculator {
    pub fn new(unknown_duration_ceiling: Duration) -> Self {
        Self {
            unknown_duration_ceiling,
        }
    }

    pub fn classify(
        &self,
        now: DateTime<Utc>,
        start: DateTime<Utc>,
        duration: Option<f64>,
    ) -> Schedule {
        if now < start {
            return Schedule::Countdown {
                remaining: Remaining::from_millis((start - now).num_milliseconds()),
            };
        }

        let elapsed = elapsed_seconds(now, start);
        match duration {
            Some(duration) if elapsed >= duration => Schedule::Ended,
            None if elapsed > self.unknown_duration_ceiling.as_secs_f64() => Schedule::Ended,
            _ => Schedule::Live { elapsed },
        }
    }
}
