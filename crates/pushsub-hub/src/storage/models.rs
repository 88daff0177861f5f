//! Row types for hub storage.

use std::str::FromStr;

use serde::Serialize;

use pushsub_core::store::StoreError;
use pushsub_core::{JobKind, Priority, RetryState, Subscriber};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriberRow {
    pub id: String,
    pub owner_id: String,
    pub callback_url: String,
    pub topic: String,
    pub nickname: String,
    pub secret: String,
    pub retry_state: i64,
    pub next_attempt_at: Option<i64>,
    pub last_update_at: i64,
    pub renewed_at: i64,
    pub version: i64,
}

impl TryFrom<SubscriberRow> for Subscriber {
    type Error = StoreError;

    fn try_from(row: SubscriberRow) -> Result<Self, Self::Error> {
        if row.retry_state > i64::from(u32::MAX) {
            return Err(StoreError::Corrupt(format!(
                "subscriber {} has retry_state {} out of range",
                row.id, row.retry_state
            )));
        }
        Ok(Self {
            state: RetryState::from_code(row.retry_state),
            id: row.id,
            owner_id: row.owner_id,
            callback_url: row.callback_url,
            topic: row.topic,
            nickname: row.nickname,
            secret: row.secret,
            next_attempt_at: row.next_attempt_at,
            last_update_at: row.last_update_at,
            renewed_at: row.renewed_at,
            version: row.version,
        })
    }
}

/// Decode a batch of rows, failing on the first corrupt one.
pub(crate) fn decode_all(rows: Vec<SubscriberRow>) -> Result<Vec<Subscriber>, StoreError> {
    rows.into_iter().map(Subscriber::try_from).collect()
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub id: i64,
    pub subscriber_id: String,
    pub kind: String,
    pub priority: i64,
    pub enqueued_at: i64,
}

/// A delivery job waiting in the outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryJob {
    pub id: i64,
    pub subscriber_id: String,
    pub kind: JobKind,
    pub priority: Priority,
    pub enqueued_at: i64,
}

impl TryFrom<JobRow> for DeliveryJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let kind = JobKind::from_str(&row.kind)
            .map_err(|e| StoreError::Corrupt(format!("delivery job {}: {e}", row.id)))?;
        Ok(Self {
            id: row.id,
            subscriber_id: row.subscriber_id,
            kind,
            priority: Priority::from_rank(row.priority),
            enqueued_at: row.enqueued_at,
        })
    }
}
