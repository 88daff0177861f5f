//! Durable delivery outbox.
//!
//! Jobs are written to the `delivery_jobs` table and claimed by an external
//! delivery worker. One job per (subscriber, kind) is kept; enqueueing again
//! only ever raises its priority.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use pushsub_core::store::StoreError;
use pushsub_core::{Clock, DispatchError, Dispatcher, JobKind, Priority, SystemClock};

use crate::storage::{DeliveryJob, HubDatabase};

/// [`Dispatcher`] writing into the hub database.
#[derive(Clone)]
pub struct OutboxDispatcher {
    db: HubDatabase,
    clock: Arc<dyn Clock>,
}

impl OutboxDispatcher {
    pub fn new(db: HubDatabase) -> Self {
        Self {
            db,
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Remove and return up to `limit` jobs, highest priority first, oldest
    /// first within a priority.
    pub async fn claim(&self, limit: usize) -> Result<Vec<DeliveryJob>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let jobs = self
            .db
            .claim_jobs(limit)
            .await?
            .into_iter()
            .map(DeliveryJob::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        if !jobs.is_empty() {
            info!(claimed = jobs.len(), "Delivery jobs claimed");
        }
        Ok(jobs)
    }

    /// Every queued job in claim order, without claiming.
    pub async fn pending(&self) -> Result<Vec<DeliveryJob>, StoreError> {
        self.db
            .pending_jobs()
            .await?
            .into_iter()
            .map(DeliveryJob::try_from)
            .collect()
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        let count = self.db.count_jobs().await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

#[async_trait]
impl Dispatcher for OutboxDispatcher {
    async fn enqueue(
        &self,
        priority: Priority,
        kind: JobKind,
        subscriber_id: &str,
    ) -> Result<(), DispatchError> {
        let inserted = self
            .db
            .enqueue_job(subscriber_id, kind.as_str(), priority.rank(), self.clock.now())
            .await
            .map_err(|e| DispatchError::Unavailable(e.to_string()))?;

        debug!(
            subscriber_id,
            kind = kind.as_str(),
            priority = %priority,
            inserted,
            "Outbox job written"
        );
        Ok(())
    }
}
