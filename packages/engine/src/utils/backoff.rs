// packages/engine/src/utils/backoff.rs
//! Exponential backoff for bounded infrastructure retries (worker starts)

use rand::Rng;
use std::time::Duration;

/// Doubles the delay after each attempt, capped at `max_delay`, with a small
/// random jitter so concurrently starting workers do not retry in lockstep.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    max_delay: Duration,
    current_delay: Duration,
    jitter: bool,
    /// Number of delays handed out so far
    pub attempt: u32,
}

impl Backoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            current_delay: initial_delay,
            jitter: true,
            attempt: 0,
        }
    }

    /// Deterministic delays (tests)
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Returns the current delay and advances the state
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current_delay;
        self.attempt += 1;
        self.current_delay = (self.current_delay * 2).min(self.max_delay);

        if self.jitter && !base.is_zero() {
            let extra = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
            base + Duration::from_millis(extra)
        } else {
            base
        }
    }

    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }

    pub fn exceeded_max_attempts(&self, max: u32) -> bool {
        self.attempt >= max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_with_cap() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(500))
            .without_jitter();
        assert_eq!(b.next_delay(), Duration::from_millis(100));
        assert_eq!(b.next_delay(), Duration::from_millis(200));
        assert_eq!(b.next_delay(), Duration::from_millis(400));
        assert_eq!(b.next_delay(), Duration::from_millis(500));
        assert_eq!(b.attempt, 4);
        assert!(b.exceeded_max_attempts(4));
    }

    #[test]
    fn test_jitter_stays_bounded() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        let d = b.next_delay();
        assert!(d >= Duration::from_millis(100));
        assert!(d <= Duration::from_millis(125));
    }

    #[test]
    fn test_reset() {
        let mut b = Backoff::new(Duration::from_millis(10), Duration::from_secs(1)).without_jitter();
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.attempt, 0);
        assert_eq!(b.next_delay(), Duration::from_millis(10));
    }
}
