//! Job queue seam for the delivery engine.
//!
//! A job drives the delivery lifecycle of one event. Claiming leases a job
//! until `locked_until`; the remaining operations settle the lease by
//! completing, stopping, rescheduling, exhausting or releasing the job.
//! A settle presented with an expired or superseded lease is a no-op.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::{
    error::Result,
    models::{DeliveryJob, EventId, JobId, Settlement},
};

/// Queue operations required by the delivery engine.
///
/// Every settle operation takes the `lease` (the `locked_until` value the
/// claim returned) and applies only while the job is still queued under that
/// lease. Otherwise it returns [`Settlement::LeaseLost`] and changes nothing.
pub trait JobQueue: Send + Sync + 'static {
    /// Leases up to `batch_size` due jobs, oldest `run_at` first.
    ///
    /// Concurrent callers never receive the same job while its lease holds.
    fn claim_due(
        &self,
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryJob>>> + Send + '_>>;

    /// Marks the job delivered after `attempts` total attempts.
    fn complete(
        &self,
        job_id: JobId,
        lease: DateTime<Utc>,
        attempts: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Settlement>> + Send + '_>>;

    /// Ends the job without delivery (missing data, not subscribed).
    fn stop(
        &self,
        job_id: JobId,
        lease: DateTime<Utc>,
        reason: String,
    ) -> Pin<Box<dyn Future<Output = Result<Settlement>> + Send + '_>>;

    /// Requeues the job for another attempt at `run_at`.
    fn reschedule(
        &self,
        job_id: JobId,
        lease: DateTime<Utc>,
        attempts: u32,
        run_at: DateTime<Utc>,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<Settlement>> + Send + '_>>;

    /// Ends the job after the final failed attempt.
    fn exhaust(
        &self,
        job_id: JobId,
        lease: DateTime<Utc>,
        attempts: u32,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<Settlement>> + Send + '_>>;

    /// Drops the lease and requeues at `run_at` without consuming an attempt.
    fn release(
        &self,
        job_id: JobId,
        lease: DateTime<Utc>,
        run_at: DateTime<Utc>,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<Settlement>> + Send + '_>>;

    /// Enqueues a new job for `event_id`, due immediately.
    fn enqueue(
        &self,
        event_id: EventId,
        max_attempts: u32,
    ) -> Pin<Box<dyn Future<Output = Result<JobId>> + Send + '_>>;
}

/// Production queue backed by the `delivery_jobs` table.
pub struct PostgresJobQueue {
    storage: Arc<courier_core::storage::Storage>,
    lease: Duration,
}

impl PostgresJobQueue {
    /// Creates a queue adapter leasing claimed jobs for `lease`.
    pub fn new(storage: Arc<courier_core::storage::Storage>, lease: Duration) -> Self {
        Self { storage, lease }
    }
}

impl JobQueue for PostgresJobQueue {
    fn claim_due(
        &self,
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryJob>>> + Send + '_>> {
        Box::pin(async move { self.storage.delivery_jobs.claim_due(batch_size, self.lease).await })
    }

    fn complete(
        &self,
        job_id: JobId,
        lease: DateTime<Utc>,
        attempts: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Settlement>> + Send + '_>> {
        Box::pin(async move { self.storage.delivery_jobs.complete(job_id, lease, attempts).await })
    }

    fn stop(
        &self,
        job_id: JobId,
        lease: DateTime<Utc>,
        reason: String,
    ) -> Pin<Box<dyn Future<Output = Result<Settlement>> + Send + '_>> {
        Box::pin(async move { self.storage.delivery_jobs.stop(job_id, lease, &reason).await })
    }

    fn reschedule(
        &self,
        job_id: JobId,
        lease: DateTime<Utc>,
        attempts: u32,
        run_at: DateTime<Utc>,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<Settlement>> + Send + '_>> {
        Box::pin(async move {
            self.storage.delivery_jobs.reschedule(job_id, lease, attempts, run_at, &error).await
        })
    }

    fn exhaust(
        &self,
        job_id: JobId,
        lease: DateTime<Utc>,
        attempts: u32,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<Settlement>> + Send + '_>> {
        Box::pin(async move {
            self.storage.delivery_jobs.exhaust(job_id, lease, attempts, &error).await
        })
    }

    fn release(
        &self,
        job_id: JobId,
        lease: DateTime<Utc>,
        run_at: DateTime<Utc>,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<Settlement>> + Send + '_>> {
        Box::pin(async move {
            self.storage.delivery_jobs.release(job_id, lease, run_at, &error).await
        })
    }

    fn enqueue(
        &self,
        event_id: EventId,
        max_attempts: u32,
    ) -> Pin<Box<dyn Future<Output = Result<JobId>> + Send + '_>> {
        Box::pin(async move { self.storage.delivery_jobs.enqueue(event_id, max_attempts).await })
    }
}

pub mod mock {
    //! In-memory job queue driven by a [`Clock`].
    //!
    //! Mirrors the PostgreSQL claim and settle semantics (due, queued, lease
    //! expired, lease guard) so engine tests can step through retries by
    //! advancing a `TestClock`.

    use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, time::Duration};

    use chrono::{DateTime, Utc};
    use courier_core::{
        error::Result,
        models::{DeliveryJob, EventId, JobId, JobStatus, Settlement},
        Clock, CoreError,
    };
    use tokio::sync::RwLock;

    use super::JobQueue;

    /// Job queue stored in a hash map.
    ///
    /// Clones share state.
    #[derive(Clone)]
    pub struct InMemoryJobQueue {
        jobs: Arc<RwLock<HashMap<JobId, DeliveryJob>>>,
        clock: Arc<dyn Clock>,
        lease: Duration,
        error: Arc<RwLock<Option<String>>>,
    }

    impl InMemoryJobQueue {
        /// Creates an empty queue leasing claimed jobs for `lease`.
        pub fn new(clock: Arc<dyn Clock>, lease: Duration) -> Self {
            Self {
                jobs: Arc::new(RwLock::new(HashMap::new())),
                clock,
                lease,
                error: Arc::new(RwLock::new(None)),
            }
        }

        /// Makes every queue operation fail with `message` until cleared.
        pub async fn fail_operations(&self, message: Option<String>) {
            *self.error.write().await = message;
        }

        /// Returns a snapshot of a job.
        pub async fn job(&self, job_id: JobId) -> Option<DeliveryJob> {
            self.jobs.read().await.get(&job_id).cloned()
        }

        /// Returns snapshots of all jobs.
        pub async fn jobs(&self) -> Vec<DeliveryJob> {
            self.jobs.read().await.values().cloned().collect()
        }

        async fn check(&self) -> Result<()> {
            match self.error.read().await.as_ref() {
                Some(message) => Err(CoreError::Database(message.clone())),
                None => Ok(()),
            }
        }

        fn lease_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
            chrono::Duration::from_std(self.lease).map_or(DateTime::<Utc>::MAX_UTC, |lease| {
                now.checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC)
            })
        }

        async fn settle<F>(
            &self,
            job_id: JobId,
            lease: DateTime<Utc>,
            apply: F,
        ) -> Result<Settlement>
        where
            F: FnOnce(&mut DeliveryJob) + Send,
        {
            self.check().await?;
            let now = self.clock.now_utc();
            let mut jobs = self.jobs.write().await;

            let Some(job) = jobs.get_mut(&job_id).filter(|job| {
                job.status == JobStatus::Queued && job.locked_until == Some(lease)
            }) else {
                return Ok(Settlement::LeaseLost);
            };

            apply(job);
            job.locked_until = None;
            job.updated_at = now;
            Ok(Settlement::Applied)
        }
    }

    fn to_i32(value: u32) -> i32 {
        i32::try_from(value).unwrap_or(i32::MAX)
    }

    impl JobQueue for InMemoryJobQueue {
        fn claim_due(
            &self,
            batch_size: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryJob>>> + Send + '_>> {
            Box::pin(async move {
                self.check().await?;
                let now = self.clock.now_utc();
                let locked_until = self.lease_until(now);
                let mut jobs = self.jobs.write().await;

                let mut due: Vec<&mut DeliveryJob> = jobs
                    .values_mut()
                    .filter(|job| {
                        job.status == JobStatus::Queued
                            && job.run_at <= now
                            && job.locked_until.map_or(true, |until| until <= now)
                    })
                    .collect();
                due.sort_by_key(|job| job.run_at);

                Ok(due
                    .into_iter()
                    .take(batch_size)
                    .map(|job| {
                        job.locked_until = Some(locked_until);
                        job.updated_at = now;
                        job.clone()
                    })
                    .collect())
            })
        }

        fn complete(
            &self,
            job_id: JobId,
            lease: DateTime<Utc>,
            attempts: u32,
        ) -> Pin<Box<dyn Future<Output = Result<Settlement>> + Send + '_>> {
            Box::pin(self.settle(job_id, lease, move |job| {
                job.status = JobStatus::Completed;
                job.attempts = to_i32(attempts);
            }))
        }

        fn stop(
            &self,
            job_id: JobId,
            lease: DateTime<Utc>,
            reason: String,
        ) -> Pin<Box<dyn Future<Output = Result<Settlement>> + Send + '_>> {
            Box::pin(self.settle(job_id, lease, move |job| {
                job.status = JobStatus::Stopped;
                job.last_error = Some(reason);
            }))
        }

        fn reschedule(
            &self,
            job_id: JobId,
            lease: DateTime<Utc>,
            attempts: u32,
            run_at: DateTime<Utc>,
            error: String,
        ) -> Pin<Box<dyn Future<Output = Result<Settlement>> + Send + '_>> {
            Box::pin(self.settle(job_id, lease, move |job| {
                job.attempts = to_i32(attempts);
                job.run_at = run_at;
                job.last_error = Some(error);
            }))
        }

        fn exhaust(
            &self,
            job_id: JobId,
            lease: DateTime<Utc>,
            attempts: u32,
            error: String,
        ) -> Pin<Box<dyn Future<Output = Result<Settlement>> + Send + '_>> {
            Box::pin(self.settle(job_id, lease, move |job| {
                job.status = JobStatus::Exhausted;
                job.attempts = to_i32(attempts);
                job.last_error = Some(error);
            }))
        }

        fn release(
            &self,
            job_id: JobId,
            lease: DateTime<Utc>,
            run_at: DateTime<Utc>,
            error: String,
        ) -> Pin<Box<dyn Future<Output = Result<Settlement>> + Send + '_>> {
            Box::pin(self.settle(job_id, lease, move |job| {
                job.run_at = run_at;
                job.last_error = Some(error);
            }))
        }

        fn enqueue(
            &self,
            event_id: EventId,
            max_attempts: u32,
        ) -> Pin<Box<dyn Future<Output = Result<JobId>> + Send + '_>> {
            Box::pin(async move {
                self.check().await?;
                let job = DeliveryJob::new(event_id, max_attempts, self.clock.now_utc());
                let job_id = job.id;
                self.jobs.write().await.insert(job_id, job);
                Ok(job_id)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{Clock, JobStatus, TestClock};

    use super::{mock::InMemoryJobQueue, *};

    fn queue() -> (TestClock, InMemoryJobQueue) {
        let clock = TestClock::new();
        let queue = InMemoryJobQueue::new(Arc::new(clock.clone()), Duration::from_secs(300));
        (clock, queue)
    }

    async fn claim_one(queue: &InMemoryJobQueue) -> (JobId, DateTime<Utc>) {
        let jobs = queue.claim_due(1).await.unwrap();
        assert_eq!(jobs.len(), 1, "expected one due job");
        (jobs[0].id, jobs[0].locked_until.unwrap())
    }

    #[tokio::test]
    async fn claimed_job_is_leased() {
        let (_clock, queue) = queue();
        let job_id = queue.enqueue(EventId::new(), 10).await.unwrap();

        let first = queue.claim_due(10).await.unwrap();
        let second = queue.claim_due(10).await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, job_id);
        assert!(first[0].locked_until.is_some());
        assert!(second.is_empty(), "leased job must not be claimed twice");
    }

    #[tokio::test]
    async fn expired_lease_makes_job_claimable_again() {
        let (clock, queue) = queue();
        queue.enqueue(EventId::new(), 10).await.unwrap();
        queue.claim_due(10).await.unwrap();

        clock.advance(Duration::from_secs(301));

        assert_eq!(queue.claim_due(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rescheduled_job_waits_for_run_at() {
        let (clock, queue) = queue();
        queue.enqueue(EventId::new(), 10).await.unwrap();
        let (job_id, lease) = claim_one(&queue).await;

        let run_at = clock.now_utc() + chrono::Duration::seconds(60);
        let settled = queue.reschedule(job_id, lease, 1, run_at, "rejected".to_string()).await;
        assert_eq!(settled.unwrap(), Settlement::Applied);

        assert!(queue.claim_due(10).await.unwrap().is_empty());
        clock.advance(Duration::from_secs(60));
        let claimed = queue.claim_due(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempts, 1);
    }

    #[tokio::test]
    async fn terminal_jobs_are_never_claimed() {
        let (_clock, queue) = queue();
        for _ in 0..3 {
            queue.enqueue(EventId::new(), 10).await.unwrap();
        }

        let (completed, lease) = claim_one(&queue).await;
        queue.complete(completed, lease, 1).await.unwrap();
        let (stopped, lease) = claim_one(&queue).await;
        queue.stop(stopped, lease, "not subscribed".to_string()).await.unwrap();
        let (exhausted, lease) = claim_one(&queue).await;
        queue.exhaust(exhausted, lease, 10, "rejected".to_string()).await.unwrap();

        assert!(queue.claim_due(10).await.unwrap().is_empty());
        assert_eq!(queue.job(completed).await.unwrap().status, JobStatus::Completed);
        assert_eq!(queue.job(stopped).await.unwrap().status, JobStatus::Stopped);
        assert_eq!(queue.job(exhausted).await.unwrap().status, JobStatus::Exhausted);
    }

    #[tokio::test]
    async fn release_keeps_attempt_count() {
        let (clock, queue) = queue();
        queue.enqueue(EventId::new(), 10).await.unwrap();
        let (job_id, lease) = claim_one(&queue).await;

        queue.release(job_id, lease, clock.now_utc(), "store down".to_string()).await.unwrap();

        let job = queue.job(job_id).await.unwrap();
        assert_eq!(job.attempts, 0);
        assert_eq!(job.locked_until, None);
        assert_eq!(job.last_error.as_deref(), Some("store down"));
    }

    #[tokio::test]
    async fn stale_lease_cannot_overwrite_reclaimed_job() {
        let (clock, queue) = queue();
        queue.enqueue(EventId::new(), 10).await.unwrap();
        let (job_id, stale_lease) = claim_one(&queue).await;

        clock.advance(Duration::from_secs(300));
        let (reclaimed, fresh_lease) = claim_one(&queue).await;
        assert_eq!(reclaimed, job_id);
        assert_eq!(queue.complete(job_id, fresh_lease, 1).await.unwrap(), Settlement::Applied);

        let stale = queue.exhaust(job_id, stale_lease, 10, "rejected".to_string()).await.unwrap();

        assert_eq!(stale, Settlement::LeaseLost);
        let job = queue.job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn stale_lease_cannot_clear_live_lease() {
        let (clock, queue) = queue();
        queue.enqueue(EventId::new(), 10).await.unwrap();
        let (job_id, stale_lease) = claim_one(&queue).await;

        clock.advance(Duration::from_secs(300));
        let (_, fresh_lease) = claim_one(&queue).await;

        let stale = queue.release(job_id, stale_lease, clock.now_utc(), "late".to_string()).await;

        assert_eq!(stale.unwrap(), Settlement::LeaseLost);
        assert_eq!(queue.job(job_id).await.unwrap().locked_until, Some(fresh_lease));
        assert!(queue.claim_due(10).await.unwrap().is_empty(), "live lease must hold");
    }

    #[tokio::test]
    async fn settling_twice_is_refused() {
        let (_clock, queue) = queue();
        queue.enqueue(EventId::new(), 10).await.unwrap();
        let (job_id, lease) = claim_one(&queue).await;

        assert_eq!(queue.complete(job_id, lease, 1).await.unwrap(), Settlement::Applied);
        let again = queue.stop(job_id, lease, "late".to_string()).await.unwrap();

        assert_eq!(again, Settlement::LeaseLost);
        assert_eq!(queue.job(job_id).await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn batch_size_limits_claims() {
        let (_clock, queue) = queue();
        for _ in 0..5 {
            queue.enqueue(EventId::new(), 10).await.unwrap();
        }

        assert_eq!(queue.claim_due(3).await.unwrap().len(), 3);
        assert_eq!(queue.claim_due(3).await.unwrap().len(), 2);
    }
}
