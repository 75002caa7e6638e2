//! Exponential reconnect backoff.

use rand::Rng;
use std::time::Duration;

/// Base delay before the first retry.
const BASE: Duration = Duration::from_secs(1);

/// Ceiling on any single delay.
const CAP: Duration = Duration::from_secs(30);

/// Jitter applied to each delay, as a fraction of the delay.
const JITTER: f64 = 0.2;

/// Doubling backoff with ±20 % jitter, capped at 30 s.
pub struct Backoff {
    attempt: u32,
    max_attempts: u32,
}

impl Backoff {
    /// Backoff allowing up to `max_attempts` retries.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts,
        }
    }

    /// Delay before the next retry, or `None` when attempts are
    /// exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let exp = BASE.as_secs_f64() * f64::from(1u32 << self.attempt.min(16));
        self.attempt += 1;

        let capped = exp.min(CAP.as_secs_f64());
        let jitter = rand::rngs::OsRng.gen_range(-JITTER..=JITTER);
        Some(Duration::from_secs_f64(capped * (1.0 + jitter)))
    }

    /// Retries consumed so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_after_max_attempts() {
        let mut backoff = Backoff::new(5);
        for _ in 0..5 {
            assert!(backoff.next_delay().is_some());
        }
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempts(), 5);
    }

    #[test]
    fn delays_grow_and_stay_capped() {
        let mut backoff = Backoff::new(10);
        let delays: Vec<Duration> = std::iter::from_fn(|| backoff.next_delay()).collect();

        // Within jitter bounds: 1s, 2s, 4s, 8s, 16s, then capped at 30s.
        let expected = [1.0, 2.0, 4.0, 8.0, 16.0, 30.0, 30.0, 30.0, 30.0, 30.0];
        for (delay, base) in delays.iter().zip(expected) {
            let secs = delay.as_secs_f64();
            assert!(secs >= base * 0.8 - 1e-9, "{secs} < {base} - 20%");
            assert!(secs <= base * 1.2 + 1e-9, "{secs} > {base} + 20%");
        }
    }

    #[test]
    fn zero_attempts_never_retries() {
        let mut backoff = Backoff::new(0);
        assert!(backoff.next_delay().is_none());
    }
}
