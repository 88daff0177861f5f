//! Subscription store seam and an in-memory implementation.
//!
//! Every method is atomic at row granularity. Read-modify-write cycles go
//! through [`SubscriptionStore::update_state`] (compare-and-set on the
//! observed row version) and renewals through [`SubscriptionStore::replace`]
//! (delete + insert as one step), so the lifecycle never needs its own locks.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::subscriber::{RetryState, StateCounts, StateUpdate, Subscriber};

/// Store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached or refused the operation. Retryable.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be decoded.
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Durable subscriber records.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get_by_id(&self, id: &str) -> Result<Option<Subscriber>, StoreError>;

    async fn get_by_callback(&self, callback_url: &str) -> Result<Option<Subscriber>, StoreError>;

    /// Snapshot of every subscriber that is due at `now`.
    async fn list_due(&self, now: i64) -> Result<Vec<Subscriber>, StoreError>;

    async fn list_idle_by_owner(&self, owner_id: &str) -> Result<Vec<Subscriber>, StoreError>;

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Subscriber>, StoreError>;

    /// Insert or overwrite the row with this subscriber's id.
    async fn upsert(&self, subscriber: &Subscriber) -> Result<(), StoreError>;

    /// Remove the row for `callback_url`, returning it if it existed.
    async fn delete_by_callback(&self, callback_url: &str)
    -> Result<Option<Subscriber>, StoreError>;

    /// Atomically remove any row for `callback_url` and insert `replacement`.
    ///
    /// `build` receives the removed row, if any, and returns the row to
    /// insert, or `None` to leave the callback unsubscribed. No observer sees
    /// both rows or, when a replacement is inserted, neither.
    async fn replace(
        &self,
        callback_url: &str,
        build: &(dyn for<'a> Fn(Option<&'a Subscriber>) -> Option<Subscriber> + Send + Sync),
    ) -> Result<Replaced, StoreError>;

    /// Compare-and-set a state transition.
    ///
    /// Applies `update` only if the row exists and, when `expected` is set,
    /// its [`Subscriber::version`] still equals `expected`. Every applied
    /// update bumps the version. Returns whether a row changed.
    async fn update_state(
        &self,
        id: &str,
        expected: Option<i64>,
        update: &StateUpdate,
    ) -> Result<bool, StoreError>;

    /// Delete terminated rows last renewed before `renewed_before`.
    async fn delete_terminated(&self, renewed_before: i64) -> Result<u64, StoreError>;

    async fn count_by_state(&self) -> Result<StateCounts, StoreError>;
}

/// Result of [`SubscriptionStore::replace`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Replaced {
    pub previous: Option<Subscriber>,
    pub current: Option<Subscriber>,
}

/// Store holding rows in a map guarded by a single lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: RwLock<HashMap<String, Subscriber>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every row, ordered by callback URL.
    pub async fn snapshot(&self) -> Vec<Subscriber> {
        let mut rows: Vec<_> = self.rows.read().await.values().cloned().collect();
        rows.sort_by(|a, b| a.callback_url.cmp(&b.callback_url));
        rows
    }
}

fn sorted(mut rows: Vec<Subscriber>) -> Vec<Subscriber> {
    rows.sort_by(|a, b| a.callback_url.cmp(&b.callback_url));
    rows
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn get_by_id(&self, id: &str) -> Result<Option<Subscriber>, StoreError> {
        Ok(self.rows.read().await.get(id).cloned())
    }

    async fn get_by_callback(&self, callback_url: &str) -> Result<Option<Subscriber>, StoreError> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .find(|s| s.callback_url == callback_url)
            .cloned())
    }

    async fn list_due(&self, now: i64) -> Result<Vec<Subscriber>, StoreError> {
        let rows = self.rows.read().await;
        Ok(sorted(rows.values().filter(|s| s.is_due(now)).cloned().collect()))
    }

    async fn list_idle_by_owner(&self, owner_id: &str) -> Result<Vec<Subscriber>, StoreError> {
        let rows = self.rows.read().await;
        Ok(sorted(
            rows.values()
                .filter(|s| s.owner_id == owner_id && s.state == RetryState::Idle)
                .cloned()
                .collect(),
        ))
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Subscriber>, StoreError> {
        let rows = self.rows.read().await;
        Ok(sorted(
            rows.values()
                .filter(|s| s.owner_id == owner_id)
                .cloned()
                .collect(),
        ))
    }

    async fn upsert(&self, subscriber: &Subscriber) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        // Keep callback_url unique: a different id for the same callback loses.
        rows.retain(|id, s| id == &subscriber.id || s.callback_url != subscriber.callback_url);
        rows.insert(subscriber.id.clone(), subscriber.clone());
        Ok(())
    }

    async fn delete_by_callback(
        &self,
        callback_url: &str,
    ) -> Result<Option<Subscriber>, StoreError> {
        let mut rows = self.rows.write().await;
        let id = rows
            .values()
            .find(|s| s.callback_url == callback_url)
            .map(|s| s.id.clone());
        Ok(id.and_then(|id| rows.remove(&id)))
    }

    async fn replace(
        &self,
        callback_url: &str,
        build: &(dyn for<'a> Fn(Option<&'a Subscriber>) -> Option<Subscriber> + Send + Sync),
    ) -> Result<Replaced, StoreError> {
        let mut rows = self.rows.write().await;
        let previous_id = rows
            .values()
            .find(|s| s.callback_url == callback_url)
            .map(|s| s.id.clone());
        let previous = previous_id.and_then(|id| rows.remove(&id));

        let current = build(previous.as_ref());
        if let Some(row) = &current {
            rows.insert(row.id.clone(), row.clone());
        }
        Ok(Replaced { previous, current })
    }

    async fn update_state(
        &self,
        id: &str,
        expected: Option<i64>,
        update: &StateUpdate,
    ) -> Result<bool, StoreError> {
        let mut rows = self.rows.write().await;
        let Some(row) = rows.get_mut(id) else {
            return Ok(false);
        };
        if expected.is_some_and(|version| version != row.version) {
            return Ok(false);
        }
        row.apply(update);
        Ok(true)
    }

    async fn delete_terminated(&self, renewed_before: i64) -> Result<u64, StoreError> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|_, s| !(s.state == RetryState::Terminated && s.renewed_at < renewed_before));
        Ok((before - rows.len()) as u64)
    }

    async fn count_by_state(&self) -> Result<StateCounts, StoreError> {
        let rows = self.rows.read().await;
        let mut counts = StateCounts::default();
        for row in rows.values() {
            counts.add(row.state);
        }
        Ok(counts)
    }
}
