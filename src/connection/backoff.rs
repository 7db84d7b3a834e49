use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(4 * 60 * 60),
        }
    }
}

/// Exponential back-off with jitter.
///
/// The `k`-th delay is drawn from `[max(previous, ceiling / 2), ceiling]` with
/// `ceiling = min(base_delay * 2^(k - 1), max_delay)`, so successive delays never decrease.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    previous: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: 0,
            previous: Duration::ZERO,
        }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Upper bound of the delay for the given attempt, starting at 1.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.config
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.config.max_delay)
            .min(self.config.max_delay)
    }

    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let ceiling = self.ceiling(self.attempt);
        let lower = self.previous.max(ceiling / 2).min(ceiling);

        let delay = if lower >= ceiling {
            ceiling
        } else {
            let millis = rand::rng()
                .random_range(lower.as_millis() as u64..=ceiling.as_millis() as u64);
            Duration::from_millis(millis)
        };
        self.previous = delay;
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.previous = Duration::ZERO;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
