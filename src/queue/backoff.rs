//! Exponential redelivery backoff.

use crate::config::QueueConfig;
use rand::Rng;
use std::time::Duration;

/// Bounded exponential backoff with additive jitter.
///
/// The delay after the n-th failed attempt is
/// `min(initial * multiplier^(n-1), max)` plus up to `jitter` of that base,
/// clamped to `max`. With `jitter <= multiplier - 1` the sequence of delays
/// never decreases.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(10),
            max: Duration::from_secs(600),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            initial: Duration::from_secs(config.min_backoff_secs),
            max: Duration::from_secs(config.max_backoff_secs),
            multiplier: config.backoff_multiplier,
            jitter: config.backoff_jitter,
        }
    }

    /// Delay before redelivering after `failed_attempt` failures, without jitter.
    pub fn base_delay(&self, failed_attempt: u32) -> Duration {
        let exponent = i32::try_from(failed_attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let max_secs = self.max.as_secs_f64();
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        if secs.is_finite() {
            Duration::from_secs_f64(secs.min(max_secs))
        } else {
            self.max
        }
    }

    pub fn delay(&self, failed_attempt: u32) -> Duration {
        self.delay_with(failed_attempt, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, failed_attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(failed_attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let extra = base.as_secs_f64() * self.jitter * rng.gen::<f64>();
        (base + Duration::from_secs_f64(extra)).min(self.max)
    }
}
