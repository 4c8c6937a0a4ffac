// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnection Supervisor
//!
//! Linear backoff: attempt `n` waits `n * base_delay`. After `max_attempts`
//! consecutive failures no further attempt is granted for the rest of the
//! process lifetime; a successful start resets the counter.

use crate::configs::ReconnectPolicy;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct ReconnectSupervisor {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl ReconnectSupervisor {
    pub fn new(policy: ReconnectPolicy) -> ReconnectSupervisor {
        ReconnectSupervisor {
            policy,
            attempts: 0,
        }
    }

    /// Delay before attempt `n` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.policy.base_delay.saturating_mul(attempt)
    }

    /// Schedules the next attempt, or `None` once every attempt is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.exhausted() {
            error!(
                attempts = self.attempts,
                "max reconnection attempts reached, giving up"
            );
            return None;
        }

        self.attempts += 1;
        let delay = self.delay_for(self.attempts);
        info!(
            attempt = self.attempts,
            max_attempts = self.policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnection attempt"
        );

        Some(delay)
    }

    /// Called after every successful start.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.policy.max_attempts
    }
}
