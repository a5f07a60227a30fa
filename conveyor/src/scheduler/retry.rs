//! Backoff between retry attempts.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay grows with successive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// base * 2^(failures - 1)
    #[default]
    Exponential,
    /// base * failures
    Linear,
    /// base
    Constant,
}

/// Randomization applied on top of the computed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Use the computed delay as is.
    None,
    /// Uniform in [0, delay].
    #[default]
    Full,
    /// Half fixed, half uniform.
    Equal,
}

/// Delay policy for Retrying jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay after the first failure, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Growth strategy.
    pub strategy: BackoffStrategy,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            strategy: BackoffStrategy::Exponential,
            jitter: JitterStrategy::Full,
        }
    }
}

impl BackoffPolicy {
    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the growth strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Un-jittered delay after `failures` failed attempts (1-based).
    #[must_use]
    pub fn nominal_delay_ms(&self, failures: u32) -> u64 {
        let step = failures.max(1);
        let delay = match self.strategy {
            BackoffStrategy::Exponential => self
                .base_delay_ms
                .saturating_mul(2u64.saturating_pow(step - 1)),
            BackoffStrategy::Linear => self.base_delay_ms.saturating_mul(u64::from(step)),
            BackoffStrategy::Constant => self.base_delay_ms,
        };
        delay.min(self.max_delay_ms)
    }

    /// Delay before the next attempt after `failures` failed attempts.
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        let delay = self.nominal_delay_ms(failures);
        let jittered = match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };
        Duration::from_millis(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_is_capped() {
        let policy = BackoffPolicy::default()
            .with_base_delay_ms(100)
            .with_max_delay_ms(1_000)
            .with_jitter(JitterStrategy::None);

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(64), Duration::from_millis(1_000));
    }

    #[test]
    fn test_linear_and_constant() {
        let linear = BackoffPolicy::default()
            .with_base_delay_ms(50)
            .with_strategy(BackoffStrategy::Linear);
        assert_eq!(linear.nominal_delay_ms(3), 150);

        let constant = linear.with_strategy(BackoffStrategy::Constant);
        assert_eq!(constant.nominal_delay_ms(3), 50);
    }

    #[test]
    fn test_jitter_bounds() {
        let full = BackoffPolicy::default().with_base_delay_ms(100);
        let equal = full.with_jitter(JitterStrategy::Equal);
        for _ in 0..100 {
            assert!(full.delay_for(2) <= Duration::from_millis(200));
            let d = equal.delay_for(2);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(200));
        }
    }

    #[test]
    fn test_policy_deserializes_partial() {
        let policy: BackoffPolicy = serde_json::from_str(r#"{"base_delay_ms": 5, "jitter": "none"}"#).unwrap();
        assert_eq!(policy.base_delay_ms, 5);
        assert_eq!(policy.jitter, JitterStrategy::None);
        assert_eq!(policy.max_delay_ms, 60_000);
    }
}
