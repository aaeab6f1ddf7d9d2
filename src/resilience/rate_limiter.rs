//! Sliding-window rate limiter.
//!
//! Keeps the timestamps of admitted requests inside the current window; a
//! request is admitted when fewer than `max_requests` remain. Waiting is a
//! timed sleep until the oldest timestamp leaves the window.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::RateLimiterConfig;

/// Sliding-window limiter shared by every caller of one dependency.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    admitted: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create an empty limiter.
    pub fn new(config: &RateLimiterConfig) -> Self {
        Self {
            max_requests: config.max_requests.max(1),
            window: config.window(),
            admitted: Mutex::new(VecDeque::with_capacity(config.max_requests)),
        }
    }

    /// Admit a request at `now`, or return how long until a slot frees up.
    fn try_admit_at(&self, now: Instant) -> Result<(), Duration> {
        let mut admitted = self.admitted.lock();
        while admitted
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            admitted.pop_front();
        }
        if admitted.len() < self.max_requests {
            admitted.push_back(now);
            return Ok(());
        }
        let oldest = admitted.front().copied().unwrap_or(now);
        Err((oldest + self.window).saturating_duration_since(now))
    }

    /// Admit a request now if the window has capacity.
    pub fn try_acquire(&self) -> bool {
        self.try_admit_at(Instant::now()).is_ok()
    }

    /// Wait until the window has capacity, then take the slot.
    pub async fn wait_for_slot(&self) {
        loop {
            match self.try_admit_at(Instant::now()) {
                Ok(()) => return,
                Err(wait) => {
                    debug!(
                        wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                        "rate limit reached, waiting"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Slots free in the current window.
    pub fn available(&self) -> usize {
        let now = Instant::now();
        let admitted = self.admitted.lock();
        let live = admitted
            .iter()
            .filter(|t| now.duration_since(**t) < self.window)
            .count();
        self.max_requests.saturating_sub(live)
    }
}
