//! Queue-driven delivery engine.
//!
//! The engine owns a pool of runners. Each runner leases due jobs from the
//! [`JobQueue`], invokes [`DeliveryWorker::deliver`] for each one, and settles
//! the job according to the returned signal:
//!
//! | Signal | Queue action |
//! |--------|--------------|
//! | `Success` | `complete` |
//! | `Stop` | `stop` |
//! | `RetryableFailure`, attempts remain | `reschedule` at `now + next_delay` |
//! | `RetryableFailure`, ceiling reached | `exhaust` |
//! | `Err(Persistence)` | `release` at `now + error_backoff`, attempt not counted |
//!
//! Every queue action presents the lease returned by the claim. If the lease
//! expired and another runner took the job over, the action is dropped and
//! the new holder decides the job's fate.
//!
//! Runners share no locks across the transport call, so distinct jobs are
//! delivered concurrently.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::{
    models::{DeliveryJob, JobId},
    Clock, Outcome, Settlement,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    client::{ClientConfig, DeliveryClient},
    error::{DeliveryError, ErrorCategory, Result},
    queue::JobQueue,
    retry::{RetryDecision, RetryPolicy},
    storage::DeliveryStorage,
    worker::{DeliverySignal, DeliveryWorker},
    worker_pool::WorkerPool,
};

/// Headroom a lease keeps beyond the worst-case time to work through a batch.
pub const LEASE_MARGIN: Duration = Duration::from_secs(30);

/// Configuration for the delivery engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Number of concurrent runners.
    pub worker_count: usize,

    /// Maximum jobs to lease per claim.
    pub batch_size: usize,

    /// How long an idle runner waits before polling again.
    pub poll_interval: Duration,

    /// How long a claimed job stays leased to its runner.
    ///
    /// Jobs in a batch are delivered one after another, so the lease must
    /// cover `batch_size` full delivery timeouts plus [`LEASE_MARGIN`].
    pub lease_duration: Duration,

    /// Delay before a job hit by a store fault becomes due again.
    pub error_backoff: Duration,

    /// Maximum time to wait for runners during shutdown.
    pub shutdown_timeout: Duration,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Backoff and attempt ceiling.
    pub retry_policy: RetryPolicy,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_secs(1),
            lease_duration: Duration::from_secs(300),
            error_backoff: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
            client_config: ClientConfig::default(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl DeliveryConfig {
    /// Checks the configuration for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` describing the first problem.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(DeliveryError::configuration("worker_count must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(DeliveryError::configuration("batch_size must be at least 1"));
        }
        let required = self.required_lease().ok_or_else(|| {
            DeliveryError::configuration("delivery timeout times batch_size overflows")
        })?;
        if self.lease_duration < required {
            return Err(DeliveryError::configuration(format!(
                "lease_duration must be at least {}s (batch_size x delivery timeout + {}s)",
                required.as_secs(),
                LEASE_MARGIN.as_secs()
            )));
        }
        self.retry_policy.validate()
    }

    /// Shortest lease that outlives a batch in which every delivery hits the
    /// timeout.
    pub fn required_lease(&self) -> Option<Duration> {
        let batch = u32::try_from(self.batch_size).ok()?;
        self.client_config.timeout.checked_mul(batch)?.checked_add(LEASE_MARGIN)
    }
}

/// Counters for engine monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Number of running runners.
    pub active_workers: usize,
    /// Jobs handled since startup, whatever the result.
    pub processed: u64,
    /// Jobs completed with a delivered event.
    pub succeeded: u64,
    /// Jobs rescheduled after a rejection or timeout.
    pub retried: u64,
    /// Jobs that reached the attempt ceiling.
    pub exhausted: u64,
    /// Jobs stopped for missing data or subscription mismatch.
    pub stopped: u64,
    /// Invocations aborted by a store failure.
    pub persistence_errors: u64,
    /// Settlements dropped because another runner had taken the job over.
    pub leases_lost: u64,
    /// Jobs currently being delivered.
    pub in_flight: u64,
}

/// Main delivery engine coordinating runners.
pub struct DeliveryEngine {
    worker: Arc<DeliveryWorker>,
    queue: Arc<dyn JobQueue>,
    config: DeliveryConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
    clock: Arc<dyn Clock>,
}

impl DeliveryEngine {
    /// Creates an engine over a data store and a job queue.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the configuration is invalid
    /// or the HTTP client cannot be built.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        queue: Arc<dyn JobQueue>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let client = Arc::new(DeliveryClient::new(config.client_config.clone())?);
        let worker = Arc::new(DeliveryWorker::new(storage, client));

        Ok(Self {
            worker,
            queue,
            config,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
            clock,
        })
    }

    /// Spawns the configured number of runners and returns.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Internal` if the engine is already running.
    pub async fn start(&mut self) -> Result<()> {
        if self.worker_pool.is_some() {
            return Err(DeliveryError::internal("delivery engine already started"));
        }

        info!(
            worker_count = self.config.worker_count,
            batch_size = self.config.batch_size,
            "starting webhook delivery engine"
        );

        let mut worker_pool = WorkerPool::new(self.runner_factory());
        worker_pool.spawn_workers().await?;
        self.worker_pool = Some(worker_pool);

        info!("delivery engine started");
        Ok(())
    }

    /// Stops the runners and waits for in-flight jobs.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if runners do not finish within
    /// `shutdown_timeout`.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");

        if let Some(worker_pool) = self.worker_pool.take() {
            worker_pool.shutdown_graceful(self.config.shutdown_timeout).await?;
        } else {
            info!("delivery engine was not started, shutdown completed immediately");
        }
        Ok(())
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Claims and settles one batch inline, without background runners.
    ///
    /// Returns the number of jobs claimed.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Queue` if claiming fails.
    pub async fn process_batch(&self) -> Result<usize> {
        self.runner_factory().build(0).process_batch().await
    }

    fn runner_factory(&self) -> RunnerFactory {
        RunnerFactory {
            worker: self.worker.clone(),
            queue: self.queue.clone(),
            config: self.config.clone(),
            stats: self.stats.clone(),
            cancellation_token: self.cancellation_token.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl Drop for DeliveryEngine {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

/// Shared ingredients for building runners.
#[derive(Clone)]
pub(crate) struct RunnerFactory {
    pub(crate) worker: Arc<DeliveryWorker>,
    pub(crate) queue: Arc<dyn JobQueue>,
    pub(crate) config: DeliveryConfig,
    pub(crate) stats: Arc<RwLock<EngineStats>>,
    pub(crate) cancellation_token: CancellationToken,
    pub(crate) clock: Arc<dyn Clock>,
}

impl RunnerFactory {
    pub(crate) fn build(&self, id: usize) -> JobRunner {
        JobRunner { id, factory: self.clone() }
    }
}

/// Poll loop that leases jobs and settles them.
pub(crate) struct JobRunner {
    id: usize,
    factory: RunnerFactory,
}

impl JobRunner {
    /// Claims and processes jobs until cancelled.
    pub(crate) async fn run(&self) -> Result<()> {
        let token = &self.factory.cancellation_token;
        let clock = &self.factory.clock;
        let config = &self.factory.config;

        loop {
            if token.is_cancelled() {
                info!(worker_id = self.id, "delivery runner received shutdown signal");
                break;
            }

            match self.process_batch().await {
                Ok(0) => {
                    tokio::select! {
                        () = clock.sleep(config.poll_interval) => {},
                        () = token.cancelled() => break,
                    }
                },
                Ok(_) => {},
                Err(error) => {
                    error!(
                        worker_id = self.id,
                        category = %ErrorCategory::from(&error),
                        error = %error,
                        "batch processing failed"
                    );
                    tokio::select! {
                        () = clock.sleep(config.error_backoff) => {},
                        () = token.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = self.id, "delivery runner stopped");
        Ok(())
    }

    /// Claims one batch and settles every job in it.
    pub(crate) async fn process_batch(&self) -> Result<usize> {
        let jobs = self
            .factory
            .queue
            .claim_due(self.factory.config.batch_size)
            .await
            .map_err(|e| DeliveryError::queue(format!("failed to claim jobs: {e}")))?;
        let claimed = jobs.len();

        if claimed > 0 {
            debug!(worker_id = self.id, claimed, "claimed delivery jobs");
        }

        let mut jobs = jobs.into_iter();
        while let Some(job) = jobs.next() {
            let Some(lease) = job.locked_until else {
                warn!(worker_id = self.id, job_id = %job.id, "claimed job carries no lease");
                continue;
            };

            if self.factory.cancellation_token.is_cancelled() {
                let remaining = jobs
                    .by_ref()
                    .filter_map(|job| job.locked_until.map(|lease| (job.id, lease)));
                self.release_unprocessed(std::iter::once((job.id, lease)).chain(remaining)).await;
                break;
            }

            if let Err(error) = self.process_job(&job, lease).await {
                error!(
                    worker_id = self.id,
                    job_id = %job.id,
                    category = %ErrorCategory::from(&error),
                    error = %error,
                    "failed to settle delivery job"
                );
            }
        }

        Ok(claimed)
    }

    /// Hands leased jobs back to the queue, due immediately, on shutdown.
    async fn release_unprocessed(&self, jobs: impl Iterator<Item = (JobId, DateTime<Utc>)>) {
        let now = self.factory.clock.now_utc();
        let mut released = 0usize;

        for (job_id, lease) in jobs {
            match self
                .factory
                .queue
                .release(job_id, lease, now, "runner shut down before delivery".to_string())
                .await
            {
                Ok(Settlement::Applied) => released += 1,
                Ok(Settlement::LeaseLost) => {},
                Err(error) => {
                    warn!(
                        worker_id = self.id,
                        job_id = %job_id,
                        error = %error,
                        "failed to release job at shutdown, it stays leased until expiry"
                    );
                },
            }
        }

        if released > 0 {
            info!(worker_id = self.id, released, "released unprocessed jobs at shutdown");
        }
    }

    async fn process_job(&self, job: &DeliveryJob, lease: DateTime<Utc>) -> Result<()> {
        let attempt = job.next_attempt_number();
        let span = info_span!(
            "delivery_job",
            worker_id = self.id,
            job_id = %job.id,
            event_id = %job.event_id,
            attempt
        );

        async move {
            self.factory.stats.write().await.in_flight += 1;

            let signal = self.factory.worker.deliver(job.event_id).await;
            let settled = self.settle(job, lease, attempt, signal).await;

            {
                let mut stats = self.factory.stats.write().await;
                stats.in_flight = stats.in_flight.saturating_sub(1);
                stats.processed += 1;
            }

            settled
        }
        .instrument(span)
        .await
    }

    async fn settle(
        &self,
        job: &DeliveryJob,
        lease: DateTime<Utc>,
        attempt: u32,
        signal: Result<DeliverySignal>,
    ) -> Result<()> {
        let queue = &self.factory.queue;

        let settled = match signal {
            Ok(DeliverySignal::Success) => {
                self.bump(|s| s.succeeded += 1).await;
                queue.complete(job.id, lease, attempt).await
            },
            Ok(DeliverySignal::Stop(reason)) => {
                self.bump(|s| s.stopped += 1).await;
                queue.stop(job.id, lease, reason.to_string()).await
            },
            Ok(DeliverySignal::RetryableFailure(outcome)) => {
                self.settle_failure(job, lease, attempt, outcome).await
            },
            Err(error) => {
                self.bump(|s| s.persistence_errors += 1).await;
                error!(
                    category = %ErrorCategory::from(&error),
                    error = %error,
                    "delivery aborted by store failure, releasing job"
                );
                let run_at = self.after(self.factory.config.error_backoff);
                queue.release(job.id, lease, run_at, error.to_string()).await
            },
        };

        match settled {
            Ok(Settlement::Applied) => Ok(()),
            Ok(Settlement::LeaseLost) => {
                self.bump(|s| s.leases_lost += 1).await;
                warn!("lease expired before the job was settled, leaving it to its new holder");
                Ok(())
            },
            Err(e) => Err(DeliveryError::queue(format!("failed to settle job {}: {e}", job.id))),
        }
    }

    async fn settle_failure(
        &self,
        job: &DeliveryJob,
        lease: DateTime<Utc>,
        attempt: u32,
        outcome: Outcome,
    ) -> courier_core::Result<Settlement> {
        let ceiling = u32::try_from(job.max_attempts).unwrap_or(0);
        let policy = self.factory.config.retry_policy.clone().with_max_attempts(ceiling);

        match policy.decide(attempt) {
            RetryDecision::Retry { delay } => {
                self.bump(|s| s.retried += 1).await;
                let run_at = self.after(delay);
                debug!(delay_secs = delay.as_secs(), run_at = %run_at, "retry scheduled");
                let error = outcome.to_string();
                self.factory.queue.reschedule(job.id, lease, attempt, run_at, error).await
            },
            RetryDecision::GiveUp { reason } => {
                self.bump(|s| s.exhausted += 1).await;
                warn!(reason = %reason, "giving up on delivery");
                let error = format!("{outcome}: {reason}");
                self.factory.queue.exhaust(job.id, lease, attempt, error).await
            },
        }
    }

    fn after(&self, delay: Duration) -> DateTime<Utc> {
        let now = self.factory.clock.now_utc();
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    async fn bump(&self, update: impl FnOnce(&mut EngineStats)) {
        update(&mut *self.factory.stats.write().await);
    }
}
