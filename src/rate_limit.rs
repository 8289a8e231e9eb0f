//! Per-account action pacing.
//!
//! Two limits apply: a fixed minimum gap between consecutive mailbox calls,
//! and a sliding one-minute budget on mutating actions. The limiter is owned
//! by one account processor and never shared.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::ProcessingLimits;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct RateLimiter {
    delay: Duration,
    max_per_window: usize,
    last: Option<Instant>,
    window: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(delay: Duration, max_actions_per_minute: u32) -> Self {
        Self {
            delay,
            max_per_window: max_actions_per_minute.max(1) as usize,
            last: None,
            window: VecDeque::new(),
        }
    }

    pub fn from_limits(limits: &ProcessingLimits) -> Self {
        Self::new(limits.inter_action_delay(), limits.max_actions_per_minute)
    }

    /// Wait out the inter-action delay without consuming a window slot.
    pub async fn pace(&mut self) {
        self.wait_for_gap().await;
        self.last = Some(Instant::now());
    }

    /// Wait until an action may run, then record it.
    pub async fn acquire(&mut self) {
        self.wait_for_gap().await;

        let now = Instant::now();
        self.evict(now);
        if self.window.len() >= self.max_per_window {
            if let Some(&oldest) = self.window.front() {
                let ready = oldest + WINDOW;
                debug!(wait_ms = (ready - now).as_millis() as u64, "Action budget exhausted, waiting");
                tokio::time::sleep_until(ready).await;
                self.evict(Instant::now());
            }
        }

        let now = Instant::now();
        self.window.push_back(now);
        self.last = Some(now);
    }

    /// Actions recorded in the trailing window.
    pub fn in_window(&self) -> usize {
        let now = Instant::now();
        self.window
            .iter()
            .filter(|t| now.duration_since(**t) < WINDOW)
            .count()
    }

    async fn wait_for_gap(&self) {
        if let Some(last) = self.last {
            let ready = last + self.delay;
            if ready > Instant::now() {
                tokio::time::sleep_until(ready).await;
            }
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&front) = self.window.front() {
            if now.duration_since(front) >= WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}
