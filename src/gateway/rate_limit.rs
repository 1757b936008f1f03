//! Per-Connection Rate Limiting
//!
//! Sliding one-minute windows owned by each connection: one for
//! subscription churn, one for client-originated messages overall. No
//! shared state; a connection can only throttle itself.

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct SlidingWindow {
    max_per_window: u32,
    window: Duration,
    count: u32,
    window_start: Instant,
}

impl SlidingWindow {
    pub fn per_minute(max_per_window: u32) -> Self {
        Self {
            max_per_window,
            window: Duration::from_secs(60),
            count: 0,
            window_start: Instant::now(),
        }
    }

    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&mut self, now: Instant) -> bool {
        if now.duration_since(self.window_start) >= self.window {
            self.count = 0;
            self.window_start = now;
        }
        self.count += 1;
        self.count <= self.max_per_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_the_ceiling() {
        let mut window = SlidingWindow::per_minute(2);
        let t0 = Instant::now();
        assert!(window.allow_at(t0));
        assert!(window.allow_at(t0));
        assert!(!window.allow_at(t0));
    }

    #[test]
    fn window_rolls_over() {
        let mut window = SlidingWindow::per_minute(1);
        let t0 = Instant::now();
        assert!(window.allow_at(t0));
        assert!(!window.allow_at(t0));
        assert!(window.allow_at(t0 + Duration::from_secs(60)));
    }
}
