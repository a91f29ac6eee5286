//! Reconnect backoff: 1, 2, 4, 8, 16, 30, 30, ... seconds.

use std::time::Duration;

const INITIAL_SECS: u64 = 1;
const MAX_SECS: u64 = 30;

/// Doubling backoff capped at 30 seconds, reset on successful connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    current_secs: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            current_secs: INITIAL_SECS,
        }
    }
}

impl Backoff {
    /// Delay to wait before the next attempt; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_secs;
        self.current_secs = (self.current_secs * 2).min(MAX_SECS);
        Duration::from_secs(delay)
    }

    pub fn reset(&mut self) {
        self.current_secs = INITIAL_SECS;
    }

    pub fn current_secs(&self) -> u64 {
        self.current_secs
    }
}
