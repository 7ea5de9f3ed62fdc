//! Exponential backoff with jitter.

use rand::Rng;
use std::time::{Duration, Instant};

use crate::config::RetryConfig;

/// Tracks retry delays for one operation: exponential growth up to a cap,
/// multiplicative jitter, and an optional total time budget.
pub(crate) struct Backoff {
    next: Duration,
    started: Instant,
    config: RetryConfig,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            next: config.initial_backoff,
            started: Instant::now(),
            config: config.clone(),
        }
    }

    /// Delay to sleep before the next attempt, or None once the total
    /// budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(budget) = self.config.total_timeout {
            if self.started.elapsed() >= budget {
                return None;
            }
        }
        let base = self.next;
        self.next = Duration::from_secs_f64(
            (base.as_secs_f64() * self.config.multiplier)
                .min(self.config.max_backoff.as_secs_f64()),
        );
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Some(base.mul_f64(jitter))
    }

    /// Reset after a successful attempt.
    pub fn reset(&mut self) {
        self.next = self.config.initial_backoff;
        self.started = Instant::now();
    }
}
