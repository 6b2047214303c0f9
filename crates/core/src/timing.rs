//! Elapsed-time accumulator for per-phase timing logs.

use std::time::{Duration, Instant};

/// Measures time between checkpoints.
///
/// [`lap`](Self::lap) returns the time since the previous lap (or since
/// start) and resets the lap mark; [`total`](Self::total) is unaffected
/// by laps.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    started: Instant,
    last_lap: Instant,
}

impl Stopwatch {
    pub fn start() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_lap: now,
        }
    }

    /// Time since the previous lap, then start a new lap.
    pub fn lap(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_lap);
        self.last_lap = now;
        elapsed
    }

    /// Time since the previous lap in milliseconds, then start a new lap.
    pub fn lap_ms(&mut self) -> u64 {
        self.lap().as_millis() as u64
    }

    /// Time since the stopwatch was started.
    pub fn total(&self) -> Duration {
        self.started.elapsed()
    }
}
