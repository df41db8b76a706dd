//! Phase Timer
//!
//! Wall-clock timing for collector phases.

use std::time::{Duration, Instant};

/// PhaseTimer - measures consecutive phases of one cycle
#[derive(Debug)]
pub struct PhaseTimer {
    start: Instant,
    lap: Instant,
}

impl PhaseTimer {
    pub fn start() -> Self {
        let now = Instant::now();
        Self { start: now, lap: now }
    }

    /// Time since the previous lap (or the start), then begin a new lap
    pub fn lap(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now - self.lap;
        self.lap = now;
        elapsed
    }

    /// Time since the timer started
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for PhaseTimer {
    fn default() -> Self {
        Self::start()
    }
}
