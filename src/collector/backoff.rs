//! Exponential retry backoff with upward jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff configuration.
///
/// Delay after `k` consecutive failures is
/// `min(cap, base * factor^(k-1) * (1 + u * jitter))` with `u` uniform in
/// `[0, 1]`. Jitter only ever lengthens a delay, and with
/// `jitter <= factor - 1` the largest delay for `k` never exceeds the smallest
/// for `k + 1`, so delays are non-decreasing in `k` and bounded by `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    #[serde(with = "humantime_serde")]
    pub base: Duration,
    pub factor: f64,
    #[serde(with = "humantime_serde")]
    pub cap: Duration,
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            factor: 2.0,
            cap: Duration::from_secs(600),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Check the invariants the ordering guarantee depends on.
    pub fn validate(&self) -> Result<(), String> {
        if self.base.is_zero() {
            return Err("backoff base must be positive".to_string());
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(format!("backoff factor must be >= 1, got {}", self.factor));
        }
        if self.cap < self.base {
            return Err("backoff cap must be >= base".to_string());
        }
        if !(0.0..=self.factor - 1.0).contains(&self.jitter) {
            return Err(format!(
                "backoff jitter must be within [0, factor - 1], got {}",
                self.jitter
            ));
        }
        Ok(())
    }

    /// Delay after `failures` consecutive failures, randomly jittered.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let u = rand::thread_rng().gen_range(0.0..=1.0);
        self.delay_with(failures, u)
    }

    /// Delay with an explicit jitter sample `u` in `[0, 1]`.
    pub fn delay_with(&self, failures: u32, u: f64) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(failures - 1).unwrap_or(i32::MAX);
        let cap = self.cap.as_secs_f64();
        let raw = self.base.as_secs_f64() * self.factor.powi(exponent);
        let jittered = raw * (1.0 + u.clamp(0.0, 1.0) * self.jitter);
        Duration::from_secs_f64(jittered.min(cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(BackoffPolicy::default().validate().is_ok());
    }

    #[test]
    fn test_deterministic_growth_and_cap() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_with(0, 0.0), Duration::ZERO);
        assert_eq!(policy.delay_with(1, 0.0), Duration::from_secs(5));
        assert_eq!(policy.delay_with(2, 0.0), Duration::from_secs(10));
        assert_eq!(policy.delay_with(3, 0.0), Duration::from_secs(20));
        assert_eq!(policy.delay_with(1, 1.0), Duration::from_secs(6));
        assert_eq!(policy.delay_with(20, 1.0), Duration::from_secs(600));
        assert_eq!(policy.delay_with(u32::MAX, 0.5), Duration::from_secs(600));
    }

    #[test]
    fn test_worst_case_jitter_stays_monotonic() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            factor: 1.5,
            cap: Duration::from_secs(30),
            jitter: 0.5,
        };
        assert!(policy.validate().is_ok());
        for k in 1..60 {
            // Largest possible delay for k vs smallest for k + 1.
            assert!(policy.delay_with(k, 1.0) <= policy.delay_with(k + 1, 0.0));
        }
    }

    #[test]
    fn test_random_delays_non_decreasing_and_capped() {
        let policy = BackoffPolicy::default();
        let mut previous = Duration::ZERO;
        for k in 1..40 {
            let delay = policy.delay_for(k);
            assert!(delay >= previous, "k={k}: {delay:?} < {previous:?}");
            assert!(delay <= policy.cap);
            previous = delay;
        }
    }

    #[test]
    fn test_validation_rejects_bad_policies() {
        let base = BackoffPolicy::default();
        assert!(BackoffPolicy { base: Duration::ZERO, ..base }.validate().is_err());
        assert!(BackoffPolicy { factor: 0.5, ..base }.validate().is_err());
        assert!(BackoffPolicy { cap: Duration::from_secs(1), ..base }.validate().is_err());
        assert!(BackoffPolicy { jitter: 1.5, ..base }.validate().is_err());
    }

    #[test]
    fn test_deserialize_humantime() {
        let policy: BackoffPolicy =
            serde_yaml::from_str("base: 2s\nfactor: 3.0\ncap: 1m\njitter: 0.1\n").unwrap();
        assert_eq!(policy.base, Duration::from_secs(2));
        assert_eq!(policy.cap, Duration::from_secs(60));
    }
}
