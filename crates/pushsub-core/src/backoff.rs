//! Retry escalation policy for failed deliveries.
//!
//! Delays grow with the fourth power of the retry count, so attempts spread
//! from minutes to roughly a day apart. Once the retry ceiling is passed the
//! question becomes whether the subscription is still wanted at all, judged
//! by how long ago it was last renewed rather than by delivery history.

use crate::clock::JitterSource;
use crate::config::BackoffConfig;
use crate::subscriber::{RetryState, StateUpdate};

const SECS_PER_DAY: i64 = 86_400;

/// Added to the retry count before raising to the fourth power.
const DELAY_OFFSET: u64 = 3;

/// Outcome of a failed delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Try again after `delay_secs`, recording `next_retry_count`.
    Retry {
        delay_secs: u64,
        next_retry_count: u32,
    },
    /// Back to idle; the next publish marks it pending again.
    Suspend,
    /// Abandoned; never attempted automatically again.
    Terminate,
}

impl Decision {
    /// The store transition this decision implies at `now`.
    pub fn state_update(self, now: i64) -> StateUpdate {
        match self {
            Self::Retry {
                delay_secs,
                next_retry_count,
            } => StateUpdate {
                state: RetryState::from_retry_count(next_retry_count),
                next_attempt_at: Some(
                    now.saturating_add(i64::try_from(delay_secs).unwrap_or(i64::MAX)),
                ),
                last_update_at: None,
            },
            Self::Suspend => StateUpdate::unconstrained(RetryState::Idle),
            Self::Terminate => StateUpdate::unconstrained(RetryState::Terminated),
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Retry { .. } => "retry",
            Self::Suspend => "suspend",
            Self::Terminate => "terminate",
        }
    }
}

/// Pure decision function over retry count, renewal age and injected jitter.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackoffPolicy {
    config: BackoffConfig,
}

impl BackoffPolicy {
    pub const fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub const fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Decide what happens after a failed attempt.
    ///
    /// `retry_count` is the subscriber's retry count at failure time (`>= 1`).
    pub fn decide(
        &self,
        retry_count: u32,
        renewed_at: i64,
        now: i64,
        jitter: &dyn JitterSource,
    ) -> Decision {
        if retry_count > self.config.max_retries {
            let inactive_days = now.saturating_sub(renewed_at).div_euclid(SECS_PER_DAY);
            if inactive_days > self.config.terminate_after_inactive_days {
                return Decision::Terminate;
            }
            return Decision::Suspend;
        }

        let count = u64::from(retry_count);
        let factor = jitter.sample(1, self.config.jitter_max_secs.max(1));
        Decision::Retry {
            delay_secs: escalation(count).saturating_add(factor.saturating_mul(count + 1)),
            next_retry_count: retry_count.saturating_add(1),
        }
    }

    /// Smallest delay a retry at `retry_count` can get.
    pub fn min_delay(&self, retry_count: u32) -> u64 {
        let count = u64::from(retry_count);
        escalation(count).saturating_add(count + 1)
    }

    /// Largest delay a retry at `retry_count` can get.
    pub fn max_delay(&self, retry_count: u32) -> u64 {
        let count = u64::from(retry_count);
        escalation(count)
            .saturating_add(self.config.jitter_max_secs.max(1).saturating_mul(count + 1))
    }
}

/// Quartic part of the delay, saturating at `u64::MAX`.
const fn escalation(count: u64) -> u64 {
    (count + DELAY_OFFSET).saturating_pow(4)
}
