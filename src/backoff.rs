//! Truncated exponential backoff schedules.

use std::time::Duration;

/// A finite (or unbounded) schedule of retry delays.
///
/// Each call to [`Backoff::next_delay`] yields the next delay of the
/// sequence `min(initial_delay * 2^min(i, max_delay_after_tries), max_delay)`.
/// Once `max_tries` delays have been handed out the schedule is exhausted and
/// yields [`Duration::ZERO`]; a `max_tries` of `0` never exhausts.
///
/// The NAT-PMP transaction layer uses one schedule as both its retransmit
/// interval and its per-attempt receive deadline, which reproduces the
/// timing required by RFC 6886 section 3.1. The mapping controller uses a
/// second, independent schedule to space out whole-protocol retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    max_tries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    max_delay_after_tries: u32,
    tries: u32,
}

impl Backoff {
    /// Create a schedule with the given parameters.
    pub const fn new(
        max_tries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        max_delay_after_tries: u32,
    ) -> Self {
        Backoff {
            max_tries,
            initial_delay,
            max_delay,
            max_delay_after_tries,
            tries: 0,
        }
    }

    /// The retransmission schedule of RFC 6886 section 3.1: nine tries,
    /// starting at 250ms and doubling up to 64s.
    pub const fn rfc6886() -> Self {
        Self::new(9, Duration::from_millis(250), Duration::from_secs(64), 8)
    }

    /// Next delay of the sequence, or [`Duration::ZERO`] once exhausted.
    pub fn next_delay(&mut self) -> Duration {
        if self.max_tries != 0 && self.tries >= self.max_tries {
            return Duration::ZERO;
        }
        let exp = self.tries.min(self.max_delay_after_tries).min(31);
        self.tries += 1;
        self.initial_delay.saturating_mul(1 << exp).min(self.max_delay)
    }

    /// Rewind the schedule to its first delay.
    pub fn reset(&mut self) {
        self.tries = 0;
    }
}

impl Default for Backoff {
    /// Unlimited tries, 5s initial delay, capped at two minutes.
    fn default() -> Self {
        Self::new(0, Duration::from_secs(5), Duration::from_secs(120), 10)
    }
}
