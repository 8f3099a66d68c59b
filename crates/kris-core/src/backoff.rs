//! Backoff sequences shared by job polling and HTTP retries.

use rand::Rng;
use std::time::Duration;

/// Jitter strategy to apply to backoff delays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Jitter {
    /// Always return the computed delay.
    #[default]
    None,
    /// Return a random delay in `[0, computed_delay]`.
    Full,
}

impl Jitter {
    fn apply(self, delay: Duration) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                let max_ms = delay.as_millis().min(u64::MAX as u128) as u64;
                Duration::from_millis(rand::rng().random_range(0..=max_ms))
            }
        }
    }
}

/// Exponential backoff calculator: `base * 2^attempt`, capped at `max_delay`.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: Option<u32>,
    jitter: Jitter,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new backoff sequence.
    ///
    /// `max_attempts` of 0 means unlimited attempts.
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts: (max_attempts != 0).then_some(max_attempts),
            jitter: Jitter::None,
            attempt: 0,
        }
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Get the next delay in the sequence, or `None` once exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }

        let base_ms = self.base_delay.as_millis();
        let max_ms = self.max_delay.as_millis();
        let multiplier = 1u128.checked_shl(self.attempt.min(63)).unwrap_or(u128::MAX);
        let capped_ms = base_ms.saturating_mul(multiplier).min(max_ms);

        self.attempt = self.attempt.saturating_add(1);
        let delay = Duration::from_millis(capped_ms.min(u64::MAX as u128) as u64);
        Some(self.jitter.apply(delay))
    }

    /// Number of delays generated so far.
    pub fn is_exhausted(&self) -> bool {
        self.max_attempts.is_some_and(|max| self.attempt >= max)
    }
}

/// Fibonacci backoff: `unit * 1, 1, 2, 3, 5, 8, ...`. Never exhausts; callers
/// bound it with an elapsed-time budget.
#[derive(Clone, Debug)]
pub struct FibonacciBackoff {
    unit: Duration,
    jitter: Jitter,
    current: u64,
    next: u64,
}

impl FibonacciBackoff {
    pub fn new(unit: Duration) -> Self {
        Self {
            unit,
            jitter: Jitter::None,
            current: 1,
            next: 1,
        }
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = self.current;
        (self.current, self.next) = (self.next, self.current.saturating_add(self.next));
        let delay = self
            .unit
            .checked_mul(factor.min(u32::MAX as u64) as u32)
            .unwrap_or(Duration::MAX);
        self.jitter.apply(delay)
    }
}
