//! Adaptive poll interval for the command runner
//!
//! Two named intervals and one accumulator: a received command switches to
//! the burst interval and resets the accumulator; once the time spent
//! sleeping in burst mode reaches the window, polling falls back to the
//! default interval.

use std::time::Duration;

use crate::constants::{COMMAND_BURST_SLEEP, COMMAND_BURST_WINDOW, COMMAND_DEFAULT_SLEEP};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    Default,
    Burst,
}

#[derive(Debug, Clone)]
pub struct PollSchedule {
    default_sleep: Duration,
    burst_sleep: Duration,
    burst_window: Duration,
    burst_elapsed: Duration,
    mode: PollMode,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self::new(COMMAND_DEFAULT_SLEEP, COMMAND_BURST_SLEEP, COMMAND_BURST_WINDOW)
    }
}

impl PollSchedule {
    pub fn new(default_sleep: Duration, burst_sleep: Duration, burst_window: Duration) -> Self {
        Self {
            default_sleep,
            burst_sleep,
            burst_window,
            burst_elapsed: Duration::ZERO,
            mode: PollMode::Default,
        }
    }

    pub fn mode(&self) -> PollMode {
        self.mode
    }

    /// Interval to sleep after a poll; `received` tells whether the poll
    /// returned a command
    pub fn next_interval(&mut self, received: bool) -> Duration {
        if received {
            self.mode = PollMode::Burst;
            self.burst_elapsed = Duration::ZERO;
        }

        if self.mode == PollMode::Burst && self.burst_elapsed >= self.burst_window {
            self.mode = PollMode::Default;
        }

        match self.mode {
            PollMode::Default => self.default_sleep,
            PollMode::Burst => {
                self.burst_elapsed += self.burst_sleep;
                self.burst_sleep
            }
        }
    }
}
