//! Iteration bounds for the test body.

use std::time::{Duration, Instant};
use tracing::trace;

/// Loop position and bounds for one test process.
///
/// With a duration bound the loop runs until that much wall-clock time has
/// elapsed since the first turn, whatever the iteration count. Otherwise it
/// runs `max_iterations` times; zero is treated as one so a loop always runs
/// at least once.
#[derive(Debug, Clone)]
pub struct LoopState {
    index: u32,
    started: Option<Instant>,
    max_iterations: u32,
    max_duration: Option<Duration>,
}

impl LoopState {
    pub fn new(iterations: u32, duration: Option<Duration>) -> Self {
        Self {
            index: 0,
            started: None,
            max_iterations: iterations.max(1),
            max_duration: duration.filter(|d| !d.is_zero()),
        }
    }

    /// Number of turns granted so far.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration
    }

    pub fn elapsed(&self) -> Duration {
        self.started.map(|s| s.elapsed()).unwrap_or_default()
    }

    /// Whether a count bound has already granted its last turn. Always false
    /// under a duration bound, which only the clock can end.
    pub fn is_exhausted(&self) -> bool {
        self.max_duration.is_none() && self.index >= self.max_iterations
    }

    /// Whether the body should run again. Call once per turn.
    pub fn should_continue(&mut self) -> bool {
        self.should_continue_at(Instant::now())
    }

    /// As [`should_continue`](Self::should_continue), against a given clock
    /// reading.
    pub fn should_continue_at(&mut self, now: Instant) -> bool {
        let started = *self.started.get_or_insert(now);

        let keep_going = match self.max_duration {
            Some(limit) => now.saturating_duration_since(started) <= limit,
            None => self.index < self.max_iterations,
        };

        if keep_going {
            self.index = self.index.saturating_add(1);
        }
        trace!(index = self.index, keep_going, "loop turn");
        keep_going
    }
}
