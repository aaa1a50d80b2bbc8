//! Database access layer implementing the repository pattern.
//!
//! The repositories translate between domain models and the PostgreSQL
//! schema. All SQL lives in this module; the schema itself lives in the
//! crate's `migrations/` directory and is applied with [`MIGRATOR`].

use std::sync::Arc;

use sqlx::{migrate::Migrator, PgPool};

pub mod delivery_jobs;
pub mod endpoints;
pub mod webhook_events;

use crate::{
    error::Result,
    models::{EventId, JobId, WebhookEvent},
    time::Clock,
};

/// Schema migrations for the courier tables, embedded at compile time.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Container for all repository instances providing unified database access.
#[derive(Clone)]
pub struct Storage {
    /// Repository for webhook event operations.
    pub webhook_events: Arc<webhook_events::Repository>,

    /// Repository for endpoint lookups.
    pub endpoints: Arc<endpoints::Repository>,

    /// Repository for the delivery job queue.
    pub delivery_jobs: Arc<delivery_jobs::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    ///
    /// The clock is used for job scheduling timestamps.
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        let pool = Arc::new(pool);

        Self {
            webhook_events: Arc::new(webhook_events::Repository::new(pool.clone())),
            endpoints: Arc::new(endpoints::Repository::new(pool.clone())),
            delivery_jobs: Arc::new(delivery_jobs::Repository::new(pool.clone(), clock)),
            pool,
        }
    }

    /// Stores a new event and enqueues its delivery job atomically.
    ///
    /// This is the producer-side entry point: either both rows exist or
    /// neither does.
    ///
    /// # Errors
    ///
    /// Returns error if either insert fails; the transaction is rolled back.
    pub async fn publish(
        &self,
        event: &WebhookEvent,
        max_attempts: u32,
    ) -> Result<(EventId, JobId)> {
        let mut tx = self.pool.begin().await?;

        let event_id = self.webhook_events.create_in_tx(&mut tx, event).await?;
        let job_id = self.delivery_jobs.enqueue_in_tx(&mut tx, event_id, max_attempts).await?;

        tx.commit().await?;
        Ok((event_id, job_id))
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;
        Ok(())
    }
}
