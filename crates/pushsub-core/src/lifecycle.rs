//! Subscriber lifecycle orchestration.
//!
//! [`SubscriptionLifecycle`] drives the state machine:
//!
//! ```text
//!   subscribe ──► Idle ──publish──► Pending ──failure──► Retrying(n)
//!                  ▲                   │                    │
//!                  └──── success ──────┴────────────────────┤
//!                  ▲                                        │ n > max
//!                  └──────────── suspend ◄──────────────────┤
//!                                          Terminated ◄─────┘ (inactive)
//! ```
//!
//! Store and dispatcher are injected capabilities; per-row serialization is
//! the store's job (compare-and-set and atomic replace).

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::backoff::{BackoffPolicy, Decision};
use crate::clock::{Clock, JitterSource, SystemClock, ThreadRngJitter};
use crate::dispatch::{Dispatcher, JobKind, Priority};
use crate::error::{Error, Result};
use crate::store::{Replaced, SubscriptionStore};
use crate::subscriber::{Renewal, RetryState, StateCounts, StateUpdate, Subscriber};

/// Attempts at a failure compare-and-set before reporting a conflict.
const MAX_CAS_ATTEMPTS: usize = 3;

const SECS_PER_DAY: i64 = 86_400;

/// State transitions reported to logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    MarkedPending,
    RetryScheduled,
    Suspended,
    Terminated,
    Delivered,
    Subscribed,
    Unsubscribed,
}

impl Transition {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MarkedPending => "marked_pending",
            Self::RetryScheduled => "retry_scheduled",
            Self::Suspended => "suspended",
            Self::Terminated => "terminated",
            Self::Delivered => "delivered",
            Self::Subscribed => "subscribed",
            Self::Unsubscribed => "unsubscribed",
        }
    }

    const fn from_decision(decision: Decision) -> Self {
        match decision {
            Decision::Retry { .. } => Self::RetryScheduled,
            Decision::Suspend => Self::Suspended,
            Decision::Terminate => Self::Terminated,
        }
    }
}

#[cfg(feature = "metrics")]
fn count(transition: Transition) {
    crate::metrics::record_transition(transition.as_str());
}

#[cfg(not(feature = "metrics"))]
const fn count(_transition: Transition) {}

/// Result of [`SubscriptionLifecycle::publish`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublishSummary {
    /// Idle subscribers moved to pending.
    pub marked: usize,
    /// Jobs handed to the dispatcher by the follow-up requeue.
    pub enqueued: usize,
}

/// Orchestrates subscriber state transitions over a store and a dispatcher.
pub struct SubscriptionLifecycle {
    store: Arc<dyn SubscriptionStore>,
    dispatcher: Arc<dyn Dispatcher>,
    clock: Arc<dyn Clock>,
    jitter: Arc<dyn JitterSource>,
    policy: BackoffPolicy,
    low_priority: Priority,
}

impl SubscriptionLifecycle {
    /// Create a lifecycle on the system clock with `rand` jitter and the
    /// default backoff policy.
    pub fn new(store: Arc<dyn SubscriptionStore>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            store,
            dispatcher,
            clock: Arc::new(SystemClock),
            jitter: Arc::new(ThreadRngJitter),
            policy: BackoffPolicy::default(),
            low_priority: Priority::Low,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    #[must_use]
    pub const fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Priority used for retries (as opposed to first attempts).
    #[must_use]
    pub const fn with_low_priority(mut self, priority: Priority) -> Self {
        self.low_priority = priority;
        self
    }

    pub const fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Mark every idle subscriber of `owner_id` pending, then requeue.
    ///
    /// Subscribers already pending or retrying keep their counters.
    #[instrument(skip(self))]
    pub async fn publish(
        &self,
        owner_id: &str,
        default_priority: Priority,
    ) -> Result<PublishSummary> {
        let idle = self.store.list_idle_by_owner(owner_id).await?;
        let to_pending = StateUpdate::unconstrained(RetryState::Pending);

        let mut marked = 0;
        for sub in &idle {
            if self
                .store
                .update_state(&sub.id, Some(sub.version), &to_pending)
                .await?
            {
                marked += 1;
                count(Transition::MarkedPending);
                debug!(
                    subscriber_id = %sub.id,
                    nickname = %sub.nickname,
                    transition = Transition::MarkedPending.as_str(),
                    "Subscriber marked pending"
                );
            }
        }

        let enqueued = self.requeue(default_priority).await?;
        info!(marked, enqueued, "Publish processed");

        Ok(PublishSummary { marked, enqueued })
    }

    /// Enqueue a delivery job for every subscriber due now.
    ///
    /// First attempts go out at `default_priority`, retries at the low
    /// priority. The store is not modified.
    #[instrument(skip(self))]
    pub async fn requeue(&self, default_priority: Priority) -> Result<usize> {
        let now = self.clock.now();
        let due = self.store.list_due(now).await?;

        for sub in &due {
            let priority = if sub.state.retry_count() > 1 {
                self.low_priority
            } else {
                default_priority
            };
            self.dispatcher
                .enqueue(priority, JobKind::Deliver, &sub.id)
                .await?;
            debug!(
                subscriber_id = %sub.id,
                priority = %priority,
                retry_count = sub.state.retry_count(),
                "Delivery job enqueued"
            );
        }

        if !due.is_empty() {
            info!(count = due.len(), "Due subscribers requeued");
        }
        Ok(due.len())
    }

    /// Apply a validated subscribe/unsubscribe handshake.
    ///
    /// Any row for the callback is replaced in one store operation. A
    /// re-subscribe keeps the delivery watermark and collapses retries back to
    /// pending.
    #[instrument(skip(self, renewal), fields(callback = %renewal.callback_url, subscribe = renewal.subscribe))]
    pub async fn renew(&self, renewal: &Renewal) -> Result<Replaced> {
        let now = self.clock.now();
        let id = uuid::Uuid::new_v4().to_string();

        let build = |previous: Option<&Subscriber>| {
            renewal
                .subscribe
                .then(|| Subscriber::renewed(id.clone(), renewal, previous, now))
        };
        let replaced = self.store.replace(&renewal.callback_url, &build).await?;

        match (&replaced.current, &replaced.previous) {
            (Some(current), previous) => {
                count(Transition::Subscribed);
                info!(
                    subscriber_id = %current.id,
                    owner_id = %current.owner_id,
                    nickname = %current.nickname,
                    topic = %current.topic,
                    state = current.state.label(),
                    renewed_from = previous.as_ref().map(|p| p.state.label()),
                    transition = Transition::Subscribed.as_str(),
                    "Subscription renewed"
                );
            }
            (None, Some(previous)) => {
                count(Transition::Unsubscribed);
                info!(
                    subscriber_id = %previous.id,
                    owner_id = %previous.owner_id,
                    nickname = %previous.nickname,
                    transition = Transition::Unsubscribed.as_str(),
                    "Subscription removed"
                );
            }
            (None, None) => {
                debug!("Unsubscribe for unknown callback");
            }
        }

        Ok(replaced)
    }

    /// Record a successful delivery of everything up to `delivered_through`.
    ///
    /// Returns `false` when the subscriber no longer exists.
    #[instrument(skip(self))]
    pub async fn record_success(&self, id: &str, delivered_through: i64) -> Result<bool> {
        let update = StateUpdate {
            state: RetryState::Idle,
            next_attempt_at: None,
            last_update_at: Some(delivered_through),
        };
        let changed = self.store.update_state(id, None, &update).await?;

        if changed {
            count(Transition::Delivered);
            info!(
                subscriber_id = %id,
                delivered_through,
                transition = Transition::Delivered.as_str(),
                "Delivery succeeded"
            );
        } else {
            debug!(subscriber_id = %id, "Success reported for unknown subscriber");
        }
        Ok(changed)
    }

    /// Record a failed delivery and apply the backoff decision.
    ///
    /// Returns `None` when the subscriber no longer exists, had no delivery
    /// outstanding, or moved on to a newer delivery cycle before the report
    /// could be written.
    #[instrument(skip(self))]
    pub async fn record_failure(&self, id: &str) -> Result<Option<Decision>> {
        let mut first_seen = None;
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let Some(sub) = self.store.get_by_id(id).await? else {
                debug!(subscriber_id = %id, "Failure reported for unknown subscriber");
                return Ok(None);
            };
            if !sub.state.is_active() {
                debug!(
                    subscriber_id = %id,
                    state = sub.state.label(),
                    "Failure reported with no delivery outstanding"
                );
                return Ok(None);
            }

            let retry_count = sub.state.retry_count();
            // After a lost race, only a higher retry count continues this cycle.
            match first_seen {
                None => first_seen = Some(retry_count),
                Some(seen) if retry_count <= seen => {
                    debug!(
                        subscriber_id = %id,
                        state = sub.state.label(),
                        "Failure report superseded by a newer delivery cycle"
                    );
                    return Ok(None);
                }
                Some(_) => {}
            }

            let now = self.clock.now();
            let decision = self
                .policy
                .decide(retry_count, sub.renewed_at, now, self.jitter.as_ref());
            let update = decision.state_update(now);

            if self
                .store
                .update_state(id, Some(sub.version), &update)
                .await?
            {
                self.report_failure(&sub, decision, now);
                return Ok(Some(decision));
            }

            debug!(subscriber_id = %id, attempt, "Subscriber changed concurrently, re-reading");
        }

        warn!(subscriber_id = %id, "Gave up applying failure after repeated conflicts");
        Err(Error::Conflict(id.to_string()))
    }

    fn report_failure(&self, sub: &Subscriber, decision: Decision, now: i64) {
        let transition = Transition::from_decision(decision);
        count(transition);
        match decision {
            Decision::Retry {
                delay_secs,
                next_retry_count,
            } => info!(
                subscriber_id = %sub.id,
                nickname = %sub.nickname,
                retry_count = next_retry_count,
                delay_secs,
                transition = transition.as_str(),
                "Delivery failed, retry scheduled"
            ),
            Decision::Suspend | Decision::Terminate => info!(
                subscriber_id = %sub.id,
                nickname = %sub.nickname,
                callback = %sub.callback_url,
                inactive_days = now.saturating_sub(sub.renewed_at) / SECS_PER_DAY,
                max_retries = self.policy.config().max_retries,
                transition = transition.as_str(),
                "Retries exhausted"
            ),
        }
    }

    /// Delete terminated subscribers not renewed in the last
    /// `older_than_days` days.
    #[instrument(skip(self))]
    pub async fn prune_terminated(&self, older_than_days: i64) -> Result<u64> {
        let cutoff = self
            .clock
            .now()
            .saturating_sub(older_than_days.saturating_mul(SECS_PER_DAY));
        let removed = self.store.delete_terminated(cutoff).await?;
        if removed > 0 {
            info!(removed, older_than_days, "Pruned terminated subscribers");
        }
        Ok(removed)
    }

    /// Number of subscribers per lifecycle state.
    pub async fn stats(&self) -> Result<StateCounts> {
        Ok(self.store.count_by_state().await?)
    }

    pub async fn subscriber(&self, id: &str) -> Result<Option<Subscriber>> {
        Ok(self.store.get_by_id(id).await?)
    }

    pub async fn subscriber_by_callback(&self, callback_url: &str) -> Result<Option<Subscriber>> {
        Ok(self.store.get_by_callback(callback_url).await?)
    }

    pub async fn subscribers_for_owner(&self, owner_id: &str) -> Result<Vec<Subscriber>> {
        Ok(self.store.list_by_owner(owner_id).await?)
    }
}
