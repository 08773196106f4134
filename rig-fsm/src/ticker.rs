//! Fixed-period tick source
//!
//! Deadlines advance by exactly one period per tick, so a slow iteration does not
//! shift every later tick. If an iteration overruns by more than a period the
//! schedule resynchronises to "now" instead of firing a burst of catch-up ticks.

use std::time::{Duration, Instant};

/// Drift-free periodic timer
#[derive(Debug, Clone)]
pub struct Ticker {
    period: Duration,
    next: Instant,
    overruns: u64,
}

impl Ticker {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next: Instant::now() + period,
            overruns: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Number of ticks that started late because the previous one overran
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Sleep until the next deadline
    pub fn wait(&mut self) {
        let now = Instant::now();
        if self.next > now {
            std::thread::sleep(self.next - now);
            self.next += self.period;
        } else {
            self.overruns += 1;
            log::trace!("Tick overran by {:?}", now - self.next);
            self.next = now + self.period;
        }
    }
}
