//! Bounded exponential backoff.
//!
//! Drives peer reconnect scheduling, per-key advertisement damping and
//! the ttl refresh cadence. `report_error` doubles the wait (bounded),
//! `report_success` clears it.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    last_error_at: Option<Instant>,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        debug_assert!(initial <= max);
        Self {
            initial,
            max,
            current: Duration::ZERO,
            last_error_at: None,
        }
    }

    pub fn can_try_now(&self) -> bool {
        self.time_remaining() == Duration::ZERO
    }

    pub fn time_remaining(&self) -> Duration {
        match self.last_error_at {
            None => Duration::ZERO,
            Some(at) => (at + self.current).saturating_duration_since(Instant::now()),
        }
    }

    pub fn report_error(&mut self) {
        self.current = if self.current.is_zero() {
            self.initial
        } else {
            (self.current * 2).min(self.max)
        };
        self.last_error_at = Some(Instant::now());
    }

    pub fn report_success(&mut self) {
        self.current = Duration::ZERO;
        self.last_error_at = None;
    }
}
