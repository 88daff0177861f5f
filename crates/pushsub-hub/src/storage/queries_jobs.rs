//! Delivery outbox queries.

use super::models::JobRow;
use super::{DatabaseError, HubDatabase};

impl HubDatabase {
    /// Queue a job, or raise the priority of the one already queued for the
    /// same subscriber and kind. Returns `true` when a new row was inserted.
    pub async fn enqueue_job(
        &self,
        subscriber_id: &str,
        kind: &str,
        priority: i64,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM delivery_jobs WHERE subscriber_id = ? AND kind = ?")
                .bind(subscriber_id)
                .bind(kind)
                .fetch_optional(&mut *tx)
                .await?;

        if let Some((id,)) = existing {
            sqlx::query("UPDATE delivery_jobs SET priority = MAX(priority, ?) WHERE id = ?")
                .bind(priority)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query(
                "INSERT INTO delivery_jobs (subscriber_id, kind, priority, enqueued_at) VALUES (?, ?, ?, ?)",
            )
            .bind(subscriber_id)
            .bind(kind)
            .bind(priority)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(existing.is_none())
    }

    /// Queued jobs in claim order (priority DESC, `enqueued_at` ASC).
    pub async fn pending_jobs(&self) -> Result<Vec<JobRow>, DatabaseError> {
        let jobs = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM delivery_jobs ORDER BY priority DESC, enqueued_at ASC, id ASC",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(jobs)
    }

    /// Remove and return up to `limit` jobs in claim order.
    pub async fn claim_jobs(&self, limit: i64) -> Result<Vec<JobRow>, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let jobs = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM delivery_jobs ORDER BY priority DESC, enqueued_at ASC, id ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        for job in &jobs {
            sqlx::query("DELETE FROM delivery_jobs WHERE id = ?")
                .bind(job.id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(jobs)
    }

    pub async fn count_jobs(&self) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM delivery_jobs")
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }
}
