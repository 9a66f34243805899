use std::time::Duration;

/// Pause schedule between acquire attempts: starts at `initial`, multiplies
/// by `multiplier` after each attempt, and never exceeds `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(10), Duration::from_millis(200), 2)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: u32) -> Self {
        Self {
            initial: initial.min(max),
            max,
            multiplier: multiplier.max(1),
        }
    }

    /// Same pause every time.
    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay, 1)
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// An endless, non-decreasing sequence of delays.
    pub fn delays(&self) -> BackoffDelays {
        BackoffDelays {
            next: self.initial,
            max: self.max,
            multiplier: self.multiplier,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackoffDelays {
    next: Duration,
    max: Duration,
    multiplier: u32,
}

impl Iterator for BackoffDelays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        self.next = current.saturating_mul(self.multiplier).min(self.max);
        Some(current)
    }
}
