//! Worker pool management with structured concurrency.
//!
//! Spawns the engine's runners as tokio tasks, keeps their join handles,
//! and shuts them down through the shared cancellation token.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::{
    engine::RunnerFactory,
    error::{DeliveryError, Result},
};

/// Supervises runner tasks.
///
/// Dropping a pool that still has running tasks cancels them; call
/// [`WorkerPool::shutdown_graceful`] to wait for in-flight jobs instead.
pub struct WorkerPool {
    factory: RunnerFactory,
    worker_handles: Vec<JoinHandle<Result<()>>>,
}

impl WorkerPool {
    pub(crate) fn new(factory: RunnerFactory) -> Self {
        Self { factory, worker_handles: Vec::new() }
    }

    /// Spawns `worker_count` runners and returns immediately.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Internal` if runners were already spawned.
    pub async fn spawn_workers(&mut self) -> Result<()> {
        if !self.worker_handles.is_empty() {
            return Err(DeliveryError::internal("worker pool already spawned"));
        }

        let worker_count = self.factory.config.worker_count;
        info!(worker_count, "spawning delivery runners");

        self.factory.stats.write().await.active_workers = worker_count;

        for worker_id in 0..worker_count {
            let runner = self.factory.build(worker_id);

            let handle = tokio::spawn(async move {
                info!(worker_id, "delivery runner starting");

                let result = runner.run().await;

                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "delivery runner terminated with error");
                }

                result
            });

            self.worker_handles.push(handle);
        }

        info!(spawned_workers = self.worker_handles.len(), "all delivery runners spawned");
        Ok(())
    }

    /// Cancels the runners and waits for them to finish their current job.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if the runners do not finish
    /// within `timeout`, or `DeliveryError::WorkerPanic` for the first runner
    /// that panicked.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful runner shutdown"
        );

        self.factory.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let stats = self.factory.stats.clone();

        let shutdown_future = async move {
            let mut first_panic = None;

            for (worker_id, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(worker_id, error = %error, "runner failed during shutdown");
                    },
                    Err(join_error) => {
                        error!(worker_id, error = %join_error, "runner task panicked");
                        if first_panic.is_none() {
                            first_panic = Some(DeliveryError::WorkerPanic {
                                worker_id,
                                error: join_error.to_string(),
                            });
                        }
                    },
                }
            }

            stats.write().await.active_workers = 0;
            first_panic
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(None) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Ok(Some(panic)) => Err(panic),
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "runner shutdown timed out, some runners may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Returns whether any runner task is still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active_count = self.worker_handles.iter().filter(|h| !h.is_finished()).count();

        if active_count > 0 && !self.factory.cancellation_token.is_cancelled() {
            warn!(
                active_workers = active_count,
                "worker pool dropped without graceful shutdown, cancelling runners"
            );
            self.factory.cancellation_token.cancel();
        }
    }
}
