// Path: crates/transport/src/backoff.rs
//! Exponential backoff with jitter.

use rand::Rng;
use std::time::Duration;

/// An exponential backoff: starts at `initial`, doubles per step, capped
/// at `cap`, with ±25 % jitter applied to every delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    cap: Duration,
    initial: Duration,
}

impl Backoff {
    /// A backoff with explicit floor and cap.
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            next: initial,
            cap,
            initial,
        }
    }

    /// The reconnect policy: 1 s floor, 30 s cap.
    pub fn reconnect() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }

    /// Returns the next delay and advances the schedule.
    pub fn delay(&mut self) -> Duration {
        let base = self.next;
        self.next = (self.next * 2).min(self.cap);
        jitter(base)
    }

    /// Resets to the floor after a success.
    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

fn jitter(d: Duration) -> Duration {
    let spread = d.as_millis() as i64 / 4;
    if spread == 0 {
        return d;
    }
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    let millis = (d.as_millis() as i64 + offset).max(1) as u64;
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(4));
        // Jitter stays within ±25 %, so bounds checks are enough.
        let d1 = b.delay();
        assert!(d1 >= Duration::from_millis(750) && d1 <= Duration::from_millis(1250));
        let d2 = b.delay();
        assert!(d2 >= Duration::from_millis(1500) && d2 <= Duration::from_millis(2500));
        let d3 = b.delay();
        assert!(d3 >= Duration::from_millis(3000) && d3 <= Duration::from_millis(5000));
        // Capped now.
        let d4 = b.delay();
        assert!(d4 >= Duration::from_millis(3000) && d4 <= Duration::from_millis(5000));
    }

    #[test]
    fn test_reset_returns_to_floor() {
        let mut b = Backoff::reconnect();
        b.delay();
        b.delay();
        b.reset();
        let d = b.delay();
        assert!(d <= Duration::from_millis(1250));
    }
}
