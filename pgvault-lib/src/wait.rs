//! Deadline polling with progressively longer sleeps.
//!
//! Polling loops (archive status waits, standby replay waits) create a
//! [`Wait`] with an outer deadline and call [`Wait::more`] at the bottom of
//! each iteration. Sleeps grow Fibonacci-style from a tenth of the timeout
//! and are capped by the time remaining, so short timeouts poll eagerly and
//! long timeouts back off.

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Wait {
    deadline: Instant,
    sleep: Duration,
    sleep_prev: Duration,
}

impl Wait {
    pub fn new(timeout: Duration) -> Self {
        let sleep = (timeout / 10).clamp(Duration::from_millis(100), Duration::from_secs(1));
        Self {
            deadline: Instant::now() + timeout,
            sleep,
            sleep_prev: Duration::ZERO,
        }
    }

    /// Time left before the deadline expires.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Returns `true` while the deadline has not expired, sleeping before
    /// returning. Returns `false` (without sleeping) once it has.
    pub fn more(&mut self) -> bool {
        let remaining = self.remaining();
        if remaining.is_zero() {
            return false;
        }
        std::thread::sleep(self.sleep.min(remaining));
        // Grow the next sleep, but never past the time that will be left.
        let next = self.sleep + self.sleep_prev;
        self.sleep_prev = self.sleep;
        self.sleep = next;
        !self.remaining().is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::Wait;
    use std::time::Duration;

    #[test]
    fn wait_expires() {
        let mut wait = Wait::new(Duration::from_millis(50));
        let mut polls = 0;
        while wait.more() {
            polls += 1;
            assert!(polls < 100, "wait never expired");
        }
        assert!(wait.remaining().is_zero());
    }

    #[test]
    fn expired_wait_does_not_sleep() {
        let mut wait = Wait::new(Duration::ZERO);
        let start = std::time::Instant::now();
        assert!(!wait.more());
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
