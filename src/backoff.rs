// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Exponential backoff used when (re)establishing the broker connection.

use crate::errors::BrokerError;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Attempts before giving up, `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl BackoffPolicy {
    /// A policy that tries exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: Some(1),
            ..Default::default()
        }
    }

    pub fn exponential(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2.0,
            max_attempts: Some(max_attempts),
        }
    }

    /// Delay to wait after the failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = self.initial_delay.as_secs_f64()
            * self.multiplier.powi(attempt.saturating_sub(1) as i32);

        let capped = delay.max(0.0).min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    /// Rejects policies whose delays would shrink or are not numbers.
    pub fn validate(&self) -> Result<(), BrokerError> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(BrokerError::InvalidConfig(format!(
                "backoff multiplier must be a finite number >= 1, got {}",
                self.multiplier
            )));
        }

        Ok(())
    }

    /// Whether another attempt is allowed after `attempt` failed ones.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_are_capped() {
        let policy = BackoffPolicy::exponential(
            Duration::from_millis(100),
            Duration::from_millis(500),
            10,
        );

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(30), Duration::from_millis(500));
    }

    #[test]
    fn negative_multiplier_never_yields_a_negative_delay() {
        let policy = BackoffPolicy {
            initial_delay: Duration::from_millis(1),
            multiplier: -2.0,
            ..Default::default()
        };

        for attempt in 1..=6 {
            assert!(policy.delay_for_attempt(attempt) <= policy.max_delay);
        }
        assert_eq!(policy.delay_for_attempt(2), Duration::ZERO);
        assert!(matches!(policy.validate(), Err(BrokerError::InvalidConfig(_))));
    }

    #[test]
    fn shrinking_or_nan_multipliers_are_invalid() {
        for multiplier in [0.5, f64::NAN, f64::INFINITY] {
            let policy = BackoffPolicy {
                multiplier,
                ..Default::default()
            };
            assert!(policy.validate().is_err());
        }

        assert_eq!(BackoffPolicy::default().validate(), Ok(()));
        assert_eq!(BackoffPolicy::no_retry().validate(), Ok(()));
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = BackoffPolicy::no_retry();
        assert!(!policy.should_retry(1));

        let unlimited = BackoffPolicy::default();
        assert!(unlimited.should_retry(1_000));
    }
}
