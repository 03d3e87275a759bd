use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

const WINDOW: Duration = Duration::from_secs(60);

/// Limits successful submissions to a number per minute
///
/// Reports over the limit stay pending, they don't count as an attempt.
pub struct RateLimiter {
    per_minute: usize,
    sent: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// `0` means unlimited
    pub fn new(reports_per_minute: u32) -> Self {
        Self {
            per_minute: reports_per_minute as usize,
            sent: Mutex::new(VecDeque::new()),
        }
    }

    #[inline]
    pub fn has_capacity(&self) -> bool {
        self.has_capacity_at(Instant::now())
    }

    pub fn has_capacity_at(&self, now: Instant) -> bool {
        if self.per_minute == 0 {
            return true;
        }

        let mut sent = self.sent.lock();
        while sent
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) >= WINDOW)
        {
            sent.pop_front();
        }
        sent.len() < self.per_minute
    }

    #[inline]
    pub fn record(&self) {
        self.record_at(Instant::now());
    }

    pub fn record_at(&self, at: Instant) {
        if self.per_minute == 0 {
            return;
        }

        let mut sent = self.sent.lock();
        sent.push_back(at);
        while sent.len() > self.per_minute {
            sent.pop_front();
        }
    }
}
