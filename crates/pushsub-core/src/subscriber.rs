//! Subscriber data model.
//!
//! A [`Subscriber`] is one (owner, callback) subscription. Its position in
//! the delivery lifecycle is the tagged [`RetryState`]; the single-integer
//! encoding used by storage backends lives in [`RetryState::code`] and
//! [`RetryState::from_code`] and nowhere else.

use serde::{Deserialize, Serialize};

/// Lifecycle position of a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryState {
    /// Nothing waiting to be delivered.
    Idle,
    /// Marked dirty by a publish, not attempted yet.
    Pending,
    /// At least one delivery attempt failed since the last success.
    Retrying {
        /// Consecutive failed attempts, always `>= 1`.
        failures: u32,
    },
    /// Given up on; never due again.
    Terminated,
}

impl RetryState {
    /// Storage encoding: `0` idle, `1` pending, `n > 1` retrying with `n - 1`
    /// failures, `-1` terminated.
    pub const fn code(self) -> i64 {
        match self {
            Self::Idle => 0,
            Self::Pending => 1,
            Self::Retrying { failures } => failures as i64 + 1,
            Self::Terminated => -1,
        }
    }

    /// Decode a stored state column. Every negative value means terminated.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub const fn from_code(code: i64) -> Self {
        match code {
            i64::MIN..=-1 => Self::Terminated,
            0 => Self::Idle,
            1 => Self::Pending,
            n => {
                let failures = n - 1;
                if failures > u32::MAX as i64 {
                    Self::Retrying { failures: u32::MAX }
                } else {
                    Self::Retrying {
                        failures: failures as u32,
                    }
                }
            }
        }
    }

    /// State for a numeric retry count as the backoff policy counts it.
    ///
    /// `0` maps to idle and `1` to pending.
    pub const fn from_retry_count(count: u32) -> Self {
        match count {
            0 => Self::Idle,
            1 => Self::Pending,
            n => Self::Retrying { failures: n - 1 },
        }
    }

    /// Numeric retry count: `1` for pending, `failures + 1` when retrying,
    /// `0` otherwise.
    pub const fn retry_count(self) -> u32 {
        match self {
            Self::Pending => 1,
            Self::Retrying { failures } => failures.saturating_add(1),
            Self::Idle | Self::Terminated => 0,
        }
    }

    /// Whether a delivery is outstanding for this state.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Retrying { .. })
    }

    /// State a renewed subscription starts from, given the row it replaces.
    ///
    /// Anything with an outstanding delivery collapses back to pending. A
    /// fresh handshake never revives a terminated row as terminated.
    pub const fn capped_for_renewal(self) -> Self {
        match self {
            Self::Pending | Self::Retrying { .. } => Self::Pending,
            Self::Idle | Self::Terminated => Self::Idle,
        }
    }

    /// Short label used in log fields and metrics attributes.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pending => "pending",
            Self::Retrying { .. } => "retrying",
            Self::Terminated => "terminated",
        }
    }
}

/// A push subscriber record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: String,
    pub owner_id: String,
    pub callback_url: String,
    pub topic: String,
    pub nickname: String,
    #[serde(skip_serializing, default)]
    pub secret: String,
    pub state: RetryState,
    /// Not attempted before this time; `None` means immediately eligible.
    pub next_attempt_at: Option<i64>,
    /// Timestamp of the newest delivered item, not of the last attempt.
    pub last_update_at: i64,
    /// Last successful subscribe/renew handshake.
    pub renewed_at: i64,
    /// Bumped by every state write; the compare-and-set token.
    #[serde(default)]
    pub version: i64,
}

impl Subscriber {
    /// Whether this subscriber should be attempted at `now`.
    pub fn is_due(&self, now: i64) -> bool {
        self.state.is_active() && self.next_attempt_at.is_none_or(|at| at <= now)
    }

    /// Build the row that replaces `previous` (if any) on a subscribe handshake.
    pub fn renewed(id: String, renewal: &Renewal, previous: Option<&Self>, now: i64) -> Self {
        let (state, last_update_at) = previous.map_or((RetryState::Idle, now), |prev| {
            (prev.state.capped_for_renewal(), prev.last_update_at)
        });

        Self {
            id,
            owner_id: renewal.owner_id.clone(),
            callback_url: renewal.callback_url.clone(),
            topic: renewal.topic.clone(),
            nickname: renewal.nickname.clone(),
            secret: renewal.secret.clone(),
            state,
            next_attempt_at: None,
            last_update_at,
            renewed_at: now,
            version: 0,
        }
    }

    /// Apply a state update in place, as a store does after a successful
    /// compare-and-set.
    pub fn apply(&mut self, update: &StateUpdate) {
        self.version = self.version.wrapping_add(1);
        self.state = update.state;
        self.next_attempt_at = update.scheduled_at();
        if let Some(ts) = update.last_update_at {
            self.last_update_at = ts;
        }
    }
}

/// Data-layer input of a subscribe/unsubscribe handshake that was already
/// validated upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Renewal {
    pub owner_id: String,
    pub nickname: String,
    pub subscribe: bool,
    pub callback_url: String,
    pub topic: String,
    pub secret: String,
}

/// A state transition to write for one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateUpdate {
    pub state: RetryState,
    pub next_attempt_at: Option<i64>,
    /// New delivery watermark; `None` keeps the stored value.
    pub last_update_at: Option<i64>,
}

impl StateUpdate {
    /// Transition with no scheduling constraint and an unchanged watermark.
    pub const fn unconstrained(state: RetryState) -> Self {
        Self {
            state,
            next_attempt_at: None,
            last_update_at: None,
        }
    }

    /// The `next_attempt_at` to store. Terminated rows never keep one.
    pub const fn scheduled_at(&self) -> Option<i64> {
        match self.state {
            RetryState::Terminated => None,
            _ => self.next_attempt_at,
        }
    }
}

/// Number of stored subscribers per lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub idle: u64,
    pub pending: u64,
    pub retrying: u64,
    pub terminated: u64,
}

impl StateCounts {
    /// Count one subscriber in `state`.
    pub const fn add(&mut self, state: RetryState) {
        match state {
            RetryState::Idle => self.idle += 1,
            RetryState::Pending => self.pending += 1,
            RetryState::Retrying { .. } => self.retrying += 1,
            RetryState::Terminated => self.terminated += 1,
        }
    }

    pub const fn total(&self) -> u64 {
        self.idle + self.pending + self.retrying + self.terminated
    }
}
