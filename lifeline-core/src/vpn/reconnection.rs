//! Reconnection policy with exponential backoff
//!
//! `ReconnectionPolicy` is validated once, at construction or while
//! parsing, and is immutable afterwards.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on `max_attempts`
pub const MAX_ATTEMPTS_LIMIT: u32 = 100;

fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_attempts() -> u32 {
    10
}

/// `[reconnection]` section as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawPolicy {
    #[serde(default = "default_initial_delay_ms")]
    initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    backoff_multiplier: f64,

    #[serde(default = "default_max_attempts")]
    max_attempts: u32,
}

/// Retry schedule for automatic reconnection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPolicy", into = "RawPolicy")]
pub struct ReconnectionPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
    max_attempts: u32,
}

impl ReconnectionPolicy {
    /// Build a policy, rejecting out-of-range values
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
        max_attempts: u32,
    ) -> Result<Self, PolicyValidationError> {
        if max_attempts == 0 || max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(PolicyValidationError::InvalidMaxAttempts(max_attempts));
        }
        if initial_delay.is_zero() {
            return Err(PolicyValidationError::ZeroInitialDelay);
        }
        if max_delay < initial_delay {
            return Err(PolicyValidationError::MaxDelayLessThanInitial {
                max: max_delay,
                initial: initial_delay,
            });
        }
        if !backoff_multiplier.is_finite() || backoff_multiplier < 1.0 {
            return Err(PolicyValidationError::InvalidBackoffMultiplier(
                backoff_multiplier,
            ));
        }

        Ok(Self {
            initial_delay,
            max_delay,
            backoff_multiplier,
            max_attempts,
        })
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before attempt `attempt` (1-indexed)
    ///
    /// Formula: initial_delay × multiplier^(attempt-1), capped at max_delay
    #[tracing::instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let max = self.max_delay.as_secs_f64();

        // powi overflows to infinity for long retry chains
        if scaled.is_finite() && scaled < max {
            Duration::from_secs_f64(scaled)
        } else {
            self.max_delay
        }
    }
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(default_initial_delay_ms()),
            max_delay: Duration::from_millis(default_max_delay_ms()),
            backoff_multiplier: default_backoff_multiplier(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl TryFrom<RawPolicy> for ReconnectionPolicy {
    type Error = PolicyValidationError;

    fn try_from(raw: RawPolicy) -> Result<Self, Self::Error> {
        Self::new(
            Duration::from_millis(raw.initial_delay_ms),
            Duration::from_millis(raw.max_delay_ms),
            raw.backoff_multiplier,
            raw.max_attempts,
        )
    }
}

impl From<ReconnectionPolicy> for RawPolicy {
    fn from(policy: ReconnectionPolicy) -> Self {
        Self {
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            backoff_multiplier: policy.backoff_multiplier,
            max_attempts: policy.max_attempts,
        }
    }
}

/// Validation errors for ReconnectionPolicy
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolicyValidationError {
    #[error("max_attempts must be between 1 and 100, got: {0}")]
    InvalidMaxAttempts(u32),

    #[error("initial_delay must be greater than zero")]
    ZeroInitialDelay,

    #[error("max_delay ({max:?}) must be >= initial_delay ({initial:?})")]
    MaxDelayLessThanInitial { max: Duration, initial: Duration },

    #[error("backoff_multiplier must be a finite number >= 1.0, got: {0}")]
    InvalidBackoffMultiplier(f64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let policy = ReconnectionPolicy::default();
        let delays: Vec<u64> = (1..=7)
            .map(|n| policy.calculate_backoff(n).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60]);
    }

    #[test]
    fn test_backoff_stays_capped() {
        let policy = ReconnectionPolicy::default();
        assert_eq!(policy.calculate_backoff(100), Duration::from_secs(60));
        assert_eq!(policy.calculate_backoff(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_fractional_multiplier() {
        let policy = ReconnectionPolicy::new(
            Duration::from_millis(500),
            Duration::from_secs(10),
            1.5,
            5,
        )
        .unwrap();
        assert_eq!(policy.calculate_backoff(1), Duration::from_millis(500));
        assert_eq!(policy.calculate_backoff(2), Duration::from_millis(750));
        assert_eq!(policy.calculate_backoff(3), Duration::from_millis(1125));
    }

    #[test]
    fn test_multiplier_of_one_is_constant() {
        let policy =
            ReconnectionPolicy::new(Duration::from_secs(3), Duration::from_secs(3), 1.0, 4)
                .unwrap();
        assert_eq!(policy.calculate_backoff(1), Duration::from_secs(3));
        assert_eq!(policy.calculate_backoff(4), Duration::from_secs(3));
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let result =
            ReconnectionPolicy::new(Duration::from_secs(1), Duration::from_secs(60), 2.0, 0);
        assert_eq!(result, Err(PolicyValidationError::InvalidMaxAttempts(0)));
    }

    #[test]
    fn test_rejects_too_many_attempts() {
        let result =
            ReconnectionPolicy::new(Duration::from_secs(1), Duration::from_secs(60), 2.0, 101);
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_zero_initial_delay() {
        let result = ReconnectionPolicy::new(Duration::ZERO, Duration::from_secs(60), 2.0, 5);
        assert_eq!(result, Err(PolicyValidationError::ZeroInitialDelay));
    }

    #[test]
    fn test_rejects_max_below_initial() {
        let result =
            ReconnectionPolicy::new(Duration::from_secs(10), Duration::from_secs(5), 2.0, 5);
        assert!(matches!(
            result,
            Err(PolicyValidationError::MaxDelayLessThanInitial { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_multiplier() {
        for multiplier in [0.5, f64::NAN, f64::INFINITY] {
            let result = ReconnectionPolicy::new(
                Duration::from_secs(1),
                Duration::from_secs(60),
                multiplier,
                5,
            );
            assert!(result.is_err(), "multiplier {} accepted", multiplier);
        }
    }

    #[test]
    fn test_parse_validates() {
        let policy: ReconnectionPolicy = toml::from_str(
            r#"
            initial_delay_ms = 250
            max_delay_ms = 4000
            backoff_multiplier = 2.0
            max_attempts = 3
            "#,
        )
        .unwrap();
        assert_eq!(policy.initial_delay(), Duration::from_millis(250));
        assert_eq!(policy.max_attempts(), 3);

        let invalid: Result<ReconnectionPolicy, _> = toml::from_str("max_attempts = 0");
        let error = invalid.unwrap_err().to_string();
        assert!(error.contains("max_attempts"), "unexpected error: {}", error);
    }

    #[test]
    fn test_parse_empty_uses_defaults() {
        let policy: ReconnectionPolicy = toml::from_str("").unwrap();
        assert_eq!(policy, ReconnectionPolicy::default());
    }
}
