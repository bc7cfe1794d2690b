//! Retry backoff.
//!
//! The default policy waits `15 + 2^min(attempt, max_power)` seconds with a
//! ±10% multiplicative jitter, so early retries come quickly and the delay
//! flattens out once the exponent saturates. Workers can override the policy
//! wholesale through [`crate::worker::Worker::backoff`].
//!
//! # Example
//!
//! ```
//! # use izi::backoff::{RetryBackoff, Strategy};
//! # use chrono::TimeDelta;
//! let backoff = RetryBackoff::new();
//!
//! // attempt 1 waits 15 + 2 seconds, within 10% either way
//! let delay = backoff.delay(1);
//! assert!(delay >= TimeDelta::milliseconds(15_300));
//! assert!(delay <= TimeDelta::milliseconds(18_700));
//! ```

use chrono::TimeDelta;
use rand::Rng;

/// Type that can be used to implement a backoff policy.
pub trait Strategy {
    /// Given the attempt that just failed, the delay before the next try.
    fn delay(&self, attempt: i32) -> TimeDelta;
}

/// A random jitter applied to a computed delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Added in the range `-delta <= jitter <= delta`.
    Absolute(TimeDelta),
    /// A proportion of the delay: `value * (1 ± ratio)`.
    Relative(f64),
}

impl Jitter {
    fn apply(&self, value: TimeDelta) -> TimeDelta {
        let millis = match self {
            Self::Absolute(delta) => delta.num_milliseconds(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio).round() as i64,
        };
        if millis == 0 {
            return value;
        }
        let jitter = rand::thread_rng().gen_range(-millis..=millis);
        value + TimeDelta::milliseconds(jitter)
    }
}

/// The default retry policy: a fixed offset plus a clamped power of two.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryBackoff {
    offset: TimeDelta,
    max_power: u32,
    jitter: Option<Jitter>,
    min: TimeDelta,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryBackoff {
    pub fn new() -> Self {
        Self {
            offset: TimeDelta::seconds(15),
            max_power: 10,
            jitter: Some(Jitter::Relative(0.1)),
            min: TimeDelta::zero(),
        }
    }

    pub const fn with_offset(mut self, offset: TimeDelta) -> Self {
        self.offset = offset;
        self
    }

    /// Clamps the exponent: any attempt at or above `max_power` waits
    /// `offset + 2^max_power` seconds (before jitter).
    pub const fn with_max_power(mut self, max_power: u32) -> Self {
        self.max_power = max_power;
        self
    }

    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    pub const fn without_jitter(mut self) -> Self {
        self.jitter = None;
        self
    }

    /// A floor for the delay, useful with large jitters.
    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.min = min;
        self
    }
}

impl Strategy for RetryBackoff {
    fn delay(&self, attempt: i32) -> TimeDelta {
        // 2^32 seconds is already beyond any sane retry horizon
        let power = (attempt.max(0) as u32).min(self.max_power).min(32);
        let mut delay = self.offset + TimeDelta::seconds(1i64 << power);

        if let Some(jitter) = self.jitter {
            delay = jitter.apply(delay);
        }

        delay.max(self.min)
    }
}
