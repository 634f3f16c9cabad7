use std::time::Duration;

use rand::Rng;

/// Exponential backoff with additive jitter.
///
/// Delay for attempt k is `min(max, base * 2^(k-1)) + jitter`, with
/// jitter drawn uniformly from `0..=base` to spread synchronized
/// reconnect storms. Callers reset on success.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Attempts made since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay to wait before the next attempt, advancing the counter.
    pub fn next_delay(&mut self) -> Duration {
        // Cap the shift so the multiplier cannot overflow.
        let exp = 1u32 << self.attempt.min(16);
        let delay = self.base.saturating_mul(exp).min(self.max);
        self.attempt = self.attempt.saturating_add(1);

        let jitter_ms = rand::thread_rng().gen_range(0..=self.base.as_millis() as u64);
        delay + Duration::from_millis(jitter_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_exponentially_within_bounds() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(5);
        let mut backoff = Backoff::new(base, max);

        for k in 1..=10u32 {
            let delay = backoff.next_delay();
            let floor = base.saturating_mul(1 << (k - 1)).min(max);
            assert!(delay >= floor, "attempt {k}: {delay:?} < {floor:?}");
            assert!(delay <= max + base, "attempt {k}: {delay:?} > {:?}", max + base);
        }
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let base = Duration::from_millis(100);
        let mut backoff = Backoff::new(base, Duration::from_secs(5));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next_delay() <= base + base);
    }

    #[test]
    fn delay_saturates_at_max_plus_jitter() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(400);
        let mut backoff = Backoff::new(base, max);
        for _ in 0..40 {
            assert!(backoff.next_delay() <= max + base);
        }
    }
}
