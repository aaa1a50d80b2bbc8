//! Repository for the delivery job queue.
//!
//! Jobs are claimed with `FOR UPDATE SKIP LOCKED` so concurrent workers never
//! lease the same row. A lease expires at `locked_until`; a crashed worker's
//! job becomes claimable again once that time has passed.
//!
//! Every settle operation is guarded by the `locked_until` value its caller
//! received from the claim, so a runner whose lease expired cannot overwrite
//! the work of the runner that re-claimed the job.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::{CoreError, Result},
    models::{DeliveryJob, EventId, JobId, JobStatus, Settlement},
    time::Clock,
};

const JOB_COLUMNS: &str = "id, event_id, attempts, max_attempts, status, run_at, locked_until, \
                           last_error, created_at, updated_at";

/// Repository for delivery job operations.
pub struct Repository {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Enqueues a job for `event_id` that is due immediately.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails or the event does not exist.
    pub async fn enqueue(&self, event_id: EventId, max_attempts: u32) -> Result<JobId> {
        self.enqueue_impl(&*self.pool, event_id, max_attempts).await
    }

    /// Enqueues a job within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn enqueue_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: EventId,
        max_attempts: u32,
    ) -> Result<JobId> {
        self.enqueue_impl(&mut **tx, event_id, max_attempts).await
    }

    async fn enqueue_impl<'e, E>(
        &self,
        executor: E,
        event_id: EventId,
        max_attempts: u32,
    ) -> Result<JobId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let job = DeliveryJob::new(event_id, max_attempts, self.clock.now_utc());

        let id = sqlx::query_scalar(
            r#"
            INSERT INTO delivery_jobs (
                id, event_id, attempts, max_attempts, status, run_at,
                locked_until, last_error, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10
            )
            RETURNING id
            "#,
        )
        .bind(job.id)
        .bind(job.event_id)
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.status.to_string())
        .bind(job.run_at)
        .bind(job.locked_until)
        .bind(&job.last_error)
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_one(executor)
        .await?;

        Ok(id)
    }

    /// Leases up to `batch_size` due jobs for `lease`.
    ///
    /// A job is due when it is queued, its `run_at` has passed, and it is not
    /// held by an unexpired lease. Oldest `run_at` first.
    ///
    /// # Errors
    ///
    /// Returns error if the claim query fails.
    pub async fn claim_due(&self, batch_size: usize, lease: Duration) -> Result<Vec<DeliveryJob>> {
        let now = self.clock.now_utc();
        let locked_until = now + to_chrono(lease)?;
        let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);

        let query = format!(
            r#"
            UPDATE delivery_jobs
            SET locked_until = $2, updated_at = $1
            WHERE id IN (
                SELECT id FROM delivery_jobs
                WHERE status = 'queued'
                  AND run_at <= $1
                  AND (locked_until IS NULL OR locked_until <= $1)
                ORDER BY run_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        );

        let mut jobs = sqlx::query_as::<_, DeliveryJob>(&query)
            .bind(now)
            .bind(locked_until)
            .bind(limit)
            .fetch_all(&*self.pool)
            .await?;

        // RETURNING does not preserve the subquery order.
        jobs.sort_by_key(|job| job.run_at);
        Ok(jobs)
    }

    /// Marks the job delivered after `attempts` total attempts.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn complete(
        &self,
        job_id: JobId,
        lease: DateTime<Utc>,
        attempts: u32,
    ) -> Result<Settlement> {
        self.finish(job_id, lease, JobStatus::Completed, Some(attempts), None).await
    }

    /// Marks the job stopped without delivery. The attempt count is kept.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn stop(
        &self,
        job_id: JobId,
        lease: DateTime<Utc>,
        reason: &str,
    ) -> Result<Settlement> {
        self.finish(job_id, lease, JobStatus::Stopped, None, Some(reason)).await
    }

    /// Marks the job exhausted after the final failed attempt.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn exhaust(
        &self,
        job_id: JobId,
        lease: DateTime<Utc>,
        attempts: u32,
        error: &str,
    ) -> Result<Settlement> {
        self.finish(job_id, lease, JobStatus::Exhausted, Some(attempts), Some(error)).await
    }

    /// Requeues the job for another attempt at `run_at`.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn reschedule(
        &self,
        job_id: JobId,
        lease: DateTime<Utc>,
        attempts: u32,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<Settlement> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET attempts = $3, run_at = $4, last_error = $5,
                locked_until = NULL, updated_at = $6
            WHERE id = $1 AND status = 'queued' AND locked_until = $2
            "#,
        )
        .bind(job_id)
        .bind(lease)
        .bind(to_i32(attempts))
        .bind(run_at)
        .bind(error)
        .bind(self.clock.now_utc())
        .execute(&*self.pool)
        .await?;

        Ok(settlement(result.rows_affected()))
    }

    /// Releases the lease and requeues at `run_at` without consuming an
    /// attempt.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn release(
        &self,
        job_id: JobId,
        lease: DateTime<Utc>,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<Settlement> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET run_at = $3, last_error = $4, locked_until = NULL, updated_at = $5
            WHERE id = $1 AND status = 'queued' AND locked_until = $2
            "#,
        )
        .bind(job_id)
        .bind(lease)
        .bind(run_at)
        .bind(error)
        .bind(self.clock.now_utc())
        .execute(&*self.pool)
        .await?;

        Ok(settlement(result.rows_affected()))
    }

    /// Finds a job by ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, job_id: JobId) -> Result<Option<DeliveryJob>> {
        let query = format!("SELECT {JOB_COLUMNS} FROM delivery_jobs WHERE id = $1");
        let job = sqlx::query_as::<_, DeliveryJob>(&query)
            .bind(job_id)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(job)
    }

    /// Moves a leased job to a terminal status.
    ///
    /// `attempts` of `None` keeps the stored count; `error` of `None` keeps
    /// the stored reason.
    async fn finish(
        &self,
        job_id: JobId,
        lease: DateTime<Utc>,
        status: JobStatus,
        attempts: Option<u32>,
        error: Option<&str>,
    ) -> Result<Settlement> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET status = $3, attempts = COALESCE($4, attempts),
                last_error = COALESCE($5, last_error),
                locked_until = NULL, updated_at = $6
            WHERE id = $1 AND status = 'queued' AND locked_until = $2
            "#,
        )
        .bind(job_id)
        .bind(lease)
        .bind(status.to_string())
        .bind(attempts.map(to_i32))
        .bind(error)
        .bind(self.clock.now_utc())
        .execute(&*self.pool)
        .await?;

        Ok(settlement(result.rows_affected()))
    }
}

/// Zero rows means the job left `queued` or was re-leased by another runner.
fn settlement(rows_affected: u64) -> Settlement {
    if rows_affected == 0 {
        Settlement::LeaseLost
    } else {
        Settlement::Applied
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| CoreError::InvalidInput(format!("lease duration out of range: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_conversion_rejects_overflow() {
        assert!(to_chrono(Duration::from_secs(300)).is_ok());
        assert!(to_chrono(Duration::MAX).is_err());
    }

    #[test]
    fn zero_rows_means_lease_lost() {
        assert_eq!(settlement(0), Settlement::LeaseLost);
        assert_eq!(settlement(1), Settlement::Applied);
    }

    #[test]
    fn attempt_counts_saturate() {
        assert_eq!(to_i32(10), 10);
        assert_eq!(to_i32(u32::MAX), i32::MAX);
    }
}
