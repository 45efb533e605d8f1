//! Retry timing shared by the HTTP clients and the queue receive loops.

use std::time::Duration;

/// Capped exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub factor: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(15),
            factor: 2.0,
        }
    }
}

impl Backoff {
    /// Backoff with no delay at all, for tests and local tooling.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            factor: 1.0,
        }
    }

    /// Delay before retry number `attempt` (1-based), with ±25% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped <= 0.0 {
            return Duration::ZERO;
        }
        let offset = (std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as f64
            / 1_000_000_000.0)
            * 2.0
            - 1.0; // [-1.0, 1.0)
        Duration::from_secs_f64((capped + capped * 0.25 * offset).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let backoff = Backoff::default();
        assert_eq!(backoff.initial_delay, Duration::from_millis(250));
        assert_eq!(backoff.max_delay, Duration::from_secs(15));
        assert!((backoff.factor - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn delays_grow_and_cap() {
        let backoff = Backoff::default();
        // Base delays: 250ms, 500ms, 1s, 2s, 4s, 8s, 15s (capped), 15s.
        let expected_base = [0.25, 0.5, 1.0, 2.0, 4.0, 8.0, 15.0, 15.0];
        for (i, &base) in expected_base.iter().enumerate() {
            let secs = backoff.delay_for_attempt((i + 1) as u32).as_secs_f64();
            assert!(
                secs >= base * 0.74 && secs <= base * 1.26,
                "attempt {}: {secs}s not within jitter of {base}s",
                i + 1
            );
        }
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let secs = Backoff::default().delay_for_attempt(u32::MAX).as_secs_f64();
        assert!(secs <= 15.0 * 1.26);
    }

    #[test]
    fn immediate_never_waits() {
        assert_eq!(Backoff::immediate().delay_for_attempt(5), Duration::ZERO);
    }
}
