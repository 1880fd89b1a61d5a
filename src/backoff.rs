//! Bounded exponential backoff for polling waits
//!
//! Both processes poll instead of blocking on a cross-process wake primitive: the consumer
//! while the ring is not ready, either side while the lock is contended. The sleep starts at
//! `initial`, doubles on every miss and never exceeds `max`.

use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Backoff {
            initial,
            max,
            current: initial,
        }
    }

    /// Returns the next delay and grows the following one
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Sleeps for the next delay
    pub fn wait(&mut self) {
        thread::sleep(self.next_delay());
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(Duration::from_millis(1), Duration::from_millis(50))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_max() {
        let mut backoff = Backoff::new(Duration::from_millis(2), Duration::from_millis(10));
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![2, 4, 8, 10, 10]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(2));
    }

    #[test]
    fn max_below_initial_is_clamped() {
        let mut backoff = Backoff::new(Duration::from_millis(5), Duration::from_millis(1));
        assert_eq!(backoff.next_delay(), Duration::from_millis(5));
        assert_eq!(backoff.next_delay(), Duration::from_millis(5));
    }
}
