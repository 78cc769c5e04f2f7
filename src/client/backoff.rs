use std::time::Duration;

use rand::RngExt;

/// Reconnection delay state: multiplicative growth up to a cap, with a
/// little jitter so a fleet of clients does not retry in lockstep.
#[derive(Clone, Debug)]
pub struct Backoff {
    delay_ms: u64,
    floor_ms: u64,
    cap_ms: u64,
    jitter_ms: u64,
}

impl Backoff {
    /// `jitter_ms` of 0 makes the sequence fully deterministic.
    pub fn new(floor_ms: u64, cap_ms: u64, jitter_ms: u64) -> Self {
        Self {
            delay_ms: floor_ms,
            floor_ms,
            cap_ms,
            jitter_ms,
        }
    }

    /// The delay to wait before the next attempt.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Grow the delay: `next = min(cap, delay * 1.5 + random(0, jitter))`.
    pub fn advance(&mut self) {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=self.jitter_ms)
        };
        self.delay_ms = (self.delay_ms + self.delay_ms / 2 + jitter).min(self.cap_ms);
    }

    /// Back to the floor, on a successful open.
    pub fn reset(&mut self) {
        self.delay_ms = self.floor_ms;
    }

    /// Shrink the current delay to at most `ceiling`; used when the user
    /// returns to a backgrounded client and staleness should end quickly.
    pub fn clamp(&mut self, ceiling: Duration) {
        self.delay_ms = self.delay_ms.min(ceiling.as_millis() as u64);
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(1000, 15_000, 500)
    }
}
