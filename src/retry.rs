//! Retry policy configuration.
//!
//! A task's policy decides whether a failed attempt is eligible for another
//! try and how long the Run Engine should wait before dispatching it. The
//! same policy type drives backoff for status reporting.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Policy for retrying failed attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// No retries: the first failure is final.
    #[default]
    None,

    /// Fixed delay between attempts.
    Fixed {
        /// Total attempts allowed, including the first.
        max_attempts: u32,
        /// Delay before each retry.
        delay: Duration,
    },

    /// Exponential backoff between attempts.
    Exponential {
        /// Total attempts allowed, including the first.
        max_attempts: u32,
        /// Delay before the first retry.
        min_delay: Duration,
        /// Upper bound for any single delay.
        max_delay: Duration,
        /// Growth factor applied per attempt.
        factor: f64,
        /// Spread each delay randomly over `[d, 2d)`, capped at `max_delay`.
        randomize: bool,
    },
}

impl RetryPolicy {
    /// Exponential backoff starting at one second, doubling, capped at five minutes.
    pub fn exponential(max_attempts: u32) -> Self {
        Self::Exponential {
            max_attempts,
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            factor: 2.0,
            randomize: false,
        }
    }

    /// Fixed delay policy.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::Fixed {
            max_attempts,
            delay,
        }
    }

    /// Enable jitter on an exponential policy. Other variants are unchanged.
    pub fn randomized(self) -> Self {
        match self {
            Self::Exponential {
                max_attempts,
                min_delay,
                max_delay,
                factor,
                ..
            } => Self::Exponential {
                max_attempts,
                min_delay,
                max_delay,
                factor,
                randomize: true,
            },
            other => other,
        }
    }

    /// Delay before the attempt following `failed_attempt` (1-indexed).
    ///
    /// Returns `None` once `failed_attempt` has used up the allowed attempts.
    pub fn delay_for_attempt(&self, failed_attempt: u32) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Fixed {
                max_attempts,
                delay,
            } => (failed_attempt < *max_attempts).then_some(*delay),
            Self::Exponential {
                max_attempts,
                min_delay,
                max_delay,
                factor,
                randomize,
            } => {
                if failed_attempt >= *max_attempts {
                    return None;
                }
                let exponent = failed_attempt.saturating_sub(1) as i32;
                let mut millis = min_delay.as_millis() as f64 * factor.max(1.0).powi(exponent);
                if *randomize {
                    millis *= rand::thread_rng().gen_range(1.0..2.0);
                }
                let capped = millis.min(max_delay.as_millis() as f64);
                Some(Duration::from_millis(capped as u64))
            }
        }
    }

    /// Total attempts allowed, including the first.
    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::None => 1,
            Self::Fixed { max_attempts, .. } => *max_attempts,
            Self::Exponential { max_attempts, .. } => *max_attempts,
        }
    }
}
