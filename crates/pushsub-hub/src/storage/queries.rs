//! Subscriber queries and the [`SubscriptionStore`] implementation.

use async_trait::async_trait;
use sqlx::{Executor, Sqlite};

use pushsub_core::store::{Replaced, StoreError, SubscriptionStore};
use pushsub_core::{RetryState, StateCounts, StateUpdate, Subscriber};

use super::models::{SubscriberRow, decode_all};
use super::{DatabaseError, HubDatabase};

/// Normalised state column: every negative code compares as terminated.
const STATE_EXPR: &str = "(CASE WHEN retry_state < 0 THEN -1 ELSE retry_state END)";

async fn insert_subscriber<'e, E>(executor: E, sub: &Subscriber) -> Result<(), DatabaseError>
where
    E: Executor<'e, Database = Sqlite>,
{
    // OR REPLACE also evicts a row holding the same callback under another id.
    sqlx::query(
        "INSERT OR REPLACE INTO subscribers \
         (id, owner_id, callback_url, topic, nickname, secret, retry_state, next_attempt_at, last_update_at, renewed_at, version) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&sub.id)
    .bind(&sub.owner_id)
    .bind(&sub.callback_url)
    .bind(&sub.topic)
    .bind(&sub.nickname)
    .bind(&sub.secret)
    .bind(sub.state.code())
    .bind(sub.next_attempt_at)
    .bind(sub.last_update_at)
    .bind(sub.renewed_at)
    .bind(sub.version)
    .execute(executor)
    .await?;
    Ok(())
}

impl HubDatabase {
    // =========================================================================
    // Row-level subscriber queries
    // =========================================================================

    pub async fn subscriber_row(&self, id: &str) -> Result<Option<SubscriberRow>, DatabaseError> {
        let row = sqlx::query_as::<_, SubscriberRow>("SELECT * FROM subscribers WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    pub async fn subscriber_row_by_callback(
        &self,
        callback_url: &str,
    ) -> Result<Option<SubscriberRow>, DatabaseError> {
        let row = sqlx::query_as::<_, SubscriberRow>(
            "SELECT * FROM subscribers WHERE callback_url = ?",
        )
        .bind(callback_url)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// Rows with a delivery outstanding whose next attempt is not in the future.
    pub async fn due_rows(&self, now: i64) -> Result<Vec<SubscriberRow>, DatabaseError> {
        let rows = sqlx::query_as::<_, SubscriberRow>(
            "SELECT * FROM subscribers \
             WHERE retry_state > 0 AND (next_attempt_at IS NULL OR next_attempt_at <= ?) \
             ORDER BY callback_url",
        )
        .bind(now)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Rows for `owner_id`, optionally limited to one encoded state.
    pub async fn owner_rows(
        &self,
        owner_id: &str,
        state: Option<RetryState>,
    ) -> Result<Vec<SubscriberRow>, DatabaseError> {
        let rows = match state {
            Some(state) => {
                sqlx::query_as::<_, SubscriberRow>(&format!(
                    "SELECT * FROM subscribers WHERE owner_id = ? AND {STATE_EXPR} = ? \
                     ORDER BY callback_url"
                ))
                .bind(owner_id)
                .bind(state.code())
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, SubscriberRow>(
                    "SELECT * FROM subscribers WHERE owner_id = ? ORDER BY callback_url",
                )
                .bind(owner_id)
                .fetch_all(self.pool())
                .await?
            }
        };
        Ok(rows)
    }

    /// Write a state transition, guarded by the expected row version.
    pub async fn set_state(
        &self,
        id: &str,
        expected: Option<i64>,
        update: &StateUpdate,
    ) -> Result<bool, DatabaseError> {
        let set = "UPDATE subscribers SET retry_state = ?, next_attempt_at = ?, \
                   last_update_at = COALESCE(?, last_update_at), version = version + 1 \
                   WHERE id = ?";
        let query = match expected {
            Some(_) => format!("{set} AND version = ?"),
            None => set.to_string(),
        };

        let mut q = sqlx::query(&query)
            .bind(update.state.code())
            .bind(update.scheduled_at())
            .bind(update.last_update_at)
            .bind(id);
        if let Some(version) = expected {
            q = q.bind(version);
        }
        let result = q.execute(self.pool()).await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_subscriber_by_callback(
        &self,
        callback_url: &str,
    ) -> Result<Option<SubscriberRow>, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let existing = sqlx::query_as::<_, SubscriberRow>(
            "SELECT * FROM subscribers WHERE callback_url = ?",
        )
        .bind(callback_url)
        .fetch_optional(&mut *tx)
        .await?;

        if existing.is_some() {
            sqlx::query("DELETE FROM subscribers WHERE callback_url = ?")
                .bind(callback_url)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(existing)
    }

    /// Delete terminated rows last renewed before `renewed_before`.
    pub async fn delete_terminated_rows(&self, renewed_before: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM subscribers WHERE retry_state < 0 AND renewed_at < ?")
            .bind(renewed_before)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn state_counts(&self) -> Result<StateCounts, DatabaseError> {
        let (idle, pending, retrying, terminated): (i64, i64, i64, i64) = sqlx::query_as(
            "SELECT \
               COALESCE(SUM(CASE WHEN retry_state = 0 THEN 1 ELSE 0 END), 0), \
               COALESCE(SUM(CASE WHEN retry_state = 1 THEN 1 ELSE 0 END), 0), \
               COALESCE(SUM(CASE WHEN retry_state > 1 THEN 1 ELSE 0 END), 0), \
               COALESCE(SUM(CASE WHEN retry_state < 0 THEN 1 ELSE 0 END), 0) \
             FROM subscribers",
        )
        .fetch_one(self.pool())
        .await?;

        let count = |n: i64| u64::try_from(n).unwrap_or(0);
        Ok(StateCounts {
            idle: count(idle),
            pending: count(pending),
            retrying: count(retrying),
            terminated: count(terminated),
        })
    }
}

#[async_trait]
impl SubscriptionStore for HubDatabase {
    async fn get_by_id(&self, id: &str) -> Result<Option<Subscriber>, StoreError> {
        self.subscriber_row(id)
            .await?
            .map(Subscriber::try_from)
            .transpose()
    }

    async fn get_by_callback(&self, callback_url: &str) -> Result<Option<Subscriber>, StoreError> {
        self.subscriber_row_by_callback(callback_url)
            .await?
            .map(Subscriber::try_from)
            .transpose()
    }

    async fn list_due(&self, now: i64) -> Result<Vec<Subscriber>, StoreError> {
        decode_all(self.due_rows(now).await?)
    }

    async fn list_idle_by_owner(&self, owner_id: &str) -> Result<Vec<Subscriber>, StoreError> {
        decode_all(self.owner_rows(owner_id, Some(RetryState::Idle)).await?)
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Subscriber>, StoreError> {
        decode_all(self.owner_rows(owner_id, None).await?)
    }

    async fn upsert(&self, subscriber: &Subscriber) -> Result<(), StoreError> {
        insert_subscriber(self.pool(), subscriber).await?;
        Ok(())
    }

    async fn delete_by_callback(
        &self,
        callback_url: &str,
    ) -> Result<Option<Subscriber>, StoreError> {
        self.delete_subscriber_by_callback(callback_url)
            .await?
            .map(Subscriber::try_from)
            .transpose()
    }

    async fn replace(
        &self,
        callback_url: &str,
        build: &(dyn for<'a> Fn(Option<&'a Subscriber>) -> Option<Subscriber> + Send + Sync),
    ) -> Result<Replaced, StoreError> {
        let mut tx = self.pool().begin().await.map_err(DatabaseError::from)?;

        let previous = sqlx::query_as::<_, SubscriberRow>(
            "SELECT * FROM subscribers WHERE callback_url = ?",
        )
        .bind(callback_url)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DatabaseError::from)?
        .map(Subscriber::try_from)
        .transpose()?;

        if previous.is_some() {
            sqlx::query("DELETE FROM subscribers WHERE callback_url = ?")
                .bind(callback_url)
                .execute(&mut *tx)
                .await
                .map_err(DatabaseError::from)?;
        }

        let current = build(previous.as_ref());
        if let Some(row) = &current {
            insert_subscriber(&mut *tx, row).await?;
        }

        tx.commit().await.map_err(DatabaseError::from)?;
        Ok(Replaced { previous, current })
    }

    async fn update_state(
        &self,
        id: &str,
        expected: Option<i64>,
        update: &StateUpdate,
    ) -> Result<bool, StoreError> {
        Ok(self.set_state(id, expected, update).await?)
    }

    async fn delete_terminated(&self, renewed_before: i64) -> Result<u64, StoreError> {
        Ok(self.delete_terminated_rows(renewed_before).await?)
    }

    async fn count_by_state(&self) -> Result<StateCounts, StoreError> {
        Ok(self.state_counts().await?)
    }
}
