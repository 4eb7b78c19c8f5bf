//! Timeout - one named software timer
//!
//! A timer is either running (`started` is set, remaining counts down from
//! it) or frozen (`started` is `None`, `remaining` holds the frozen value).

use std::fmt;
use std::time::{Duration, Instant};

use operant_core::{ChamberId, Metadata};

/// Timer identity: names are unique per chamber
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeoutKey {
    pub chamber: ChamberId,
    pub name: String,
}

impl TimeoutKey {
    pub fn new(chamber: ChamberId, name: impl Into<String>) -> Self {
        TimeoutKey {
            chamber,
            name: name.into(),
        }
    }
}

impl fmt::Debug for TimeoutKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timeout({}/{})", self.chamber, self.name)
    }
}

impl fmt::Display for TimeoutKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.chamber, self.name)
    }
}

/// Invoked on the manager thread when a timer fires
pub type TimeoutCallback = Box<dyn FnMut(&TimeoutKey, &Metadata) + Send>;

/// A software timer
pub struct Timeout {
    pub key: TimeoutKey,
    /// Total duration, including extensions
    pub duration: Duration,
    /// Remaining duration as of `started` (or frozen, when paused)
    remaining: Duration,
    started: Option<Instant>,
    callback: TimeoutCallback,
    pub metadata: Metadata,
}

impl Timeout {
    pub fn new(
        key: TimeoutKey,
        duration: Duration,
        callback: impl FnMut(&TimeoutKey, &Metadata) + Send + 'static,
    ) -> Self {
        Timeout {
            key,
            duration,
            remaining: duration,
            started: None,
            callback: Box::new(callback),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Arm the timer from its full duration
    pub fn start(&mut self, now: Instant) {
        self.remaining = self.duration;
        self.started = Some(now);
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    /// Remaining time as of `now`
    pub fn remaining(&self, now: Instant) -> Duration {
        match self.started {
            Some(started) => self
                .remaining
                .saturating_sub(now.saturating_duration_since(started)),
            None => self.remaining,
        }
    }

    /// Instant the timer is due, if running
    pub fn deadline(&self) -> Option<Instant> {
        self.started.map(|started| started + self.remaining)
    }

    /// Freeze the remaining duration. No-op if already paused.
    pub fn pause(&mut self, now: Instant) {
        if self.started.is_some() {
            self.remaining = self.remaining(now);
            self.started = None;
        }
    }

    /// Restart the countdown from the frozen remaining value. No-op if running.
    pub fn resume(&mut self, now: Instant) {
        if self.started.is_none() {
            self.started = Some(now);
        }
    }

    /// Add `delta` to both the total duration and the remaining time
    pub fn extend(&mut self, delta: Duration) {
        self.duration += delta;
        self.remaining += delta;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.started.is_some() && self.remaining(now).is_zero()
    }

    pub(crate) fn fire(&mut self) {
        (self.callback)(&self.key, &self.metadata);
    }
}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("key", &self.key)
            .field("duration", &self.duration)
            .field("remaining", &self.remaining)
            .field("running", &self.is_running())
            .finish()
    }
}
