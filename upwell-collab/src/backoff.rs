//! Linear reconnect backoff: attempt `n` waits `n * base`.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max_retries: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_retries: u32) -> Self {
        Self {
            base,
            max_retries,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` once retries are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_retries {
            return None;
        }
        self.attempt += 1;
        Some(self.base * self.attempt)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_retries
    }
}
