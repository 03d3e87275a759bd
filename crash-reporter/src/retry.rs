use std::time::Duration;

/// Exponential backoff for failed deliveries
///
/// The attempt count is persisted with each report, so backoff resumes where
/// it left off after a restart.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// The number of failed attempts after which a report is given up on
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Scales each delay by a random factor in `0.5..1.5`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60 * 60),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    #[inline]
    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    #[inline]
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    #[inline]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[inline]
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// True once `failed_attempts` reaches the limit
    #[inline]
    pub fn exhausted(&self, failed_attempts: u32) -> bool {
        failed_attempts >= self.max_attempts
    }

    /// The delay before the next attempt, after `failed_attempts` (>= 1)
    /// failures
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let exponential = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = exponential.min(self.max_delay.as_secs_f64());

        let delay = if self.jitter {
            capped * (0.5 + fastrand::f64())
        } else {
            capped
        };

        Duration::try_from_secs_f64(delay).unwrap_or(self.max_delay)
    }

    /// [`Self::delay`], but never shorter than the floor the server asked for
    #[inline]
    pub fn backoff(&self, failed_attempts: u32, floor: Option<Duration>) -> Duration {
        let delay = self.delay(failed_attempts);
        floor.map_or(delay, |floor| delay.max(floor))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exponential_and_capped() {
        let policy = RetryPolicy::default()
            .base_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(10))
            .jitter(false);

        let delays: Vec<_> = (1..=6).map(|n| policy.delay(n).as_secs()).collect();
        assert_eq!(delays, [1, 2, 4, 8, 10, 10]);
    }

    #[test]
    fn jitter_stays_in_range() {
        let policy = RetryPolicy::default()
            .base_delay(Duration::from_secs(10))
            .max_delay(Duration::from_secs(100));

        for _ in 0..100 {
            let delay = policy.delay(2);
            assert!(delay >= Duration::from_secs(10) && delay <= Duration::from_secs(30));
        }
    }

    #[test]
    fn floor() {
        let policy = RetryPolicy::default()
            .base_delay(Duration::from_secs(1))
            .jitter(false);

        assert_eq!(
            policy.backoff(1, Some(Duration::from_secs(120))),
            Duration::from_secs(120)
        );
        assert_eq!(
            policy.backoff(3, Some(Duration::from_millis(1))),
            Duration::from_secs(4)
        );
        assert_eq!(policy.backoff(2, None), Duration::from_secs(2));
    }

    #[test]
    fn exhaustion() {
        let policy = RetryPolicy::default().max_attempts(3);
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));
    }
}
