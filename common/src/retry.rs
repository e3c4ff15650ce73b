//! Exponential backoff for the transient-error policy: connection drops
//! and timeouts retry with growing delays, everything else surfaces.

use std::time::Duration;

use crate::cancel::CancelToken;
use crate::config::RetryConfig;

pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempts_left: u32,
    budget: u32,
}

impl Backoff {
    pub fn new(cfg: &RetryConfig) -> Self {
        Backoff {
            initial: Duration::from_millis(cfg.initial_backoff_ms),
            max: Duration::from_millis(cfg.max_backoff_ms),
            current: Duration::from_millis(cfg.initial_backoff_ms),
            attempts_left: cfg.max_retries,
            budget: cfg.max_retries,
        }
    }

    /// Call after any success so the next failure starts small again.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts_left = self.budget;
    }

    /// Sleep the current delay and double it. `false` once the attempt
    /// budget is spent or the token fires; the caller then gives up.
    pub async fn sleep_or_give_up(&mut self, cancel: &mut CancelToken) -> bool {
        if self.attempts_left == 0 {
            return false;
        }
        self.attempts_left -= 1;
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(self.current) => {}
        }
        self.current = (self.current * 2).min(self.max);
        true
    }
}
