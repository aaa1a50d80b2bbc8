//! Repository for webhook event database operations.
//!
//! Events are written by producers and read by the delivery worker. The only
//! mutation after creation is replacing the latest attempt record.

use std::sync::Arc;

use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{AttemptRecord, EventId, WebhookEvent},
};

/// Repository for webhook event database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Creates a new webhook event.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails or constraints are violated.
    pub async fn create(&self, event: &WebhookEvent) -> Result<EventId> {
        self.create_impl(&*self.pool, event).await
    }

    /// Creates a webhook event within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &WebhookEvent,
    ) -> Result<EventId> {
        self.create_impl(&mut **tx, event).await
    }

    async fn create_impl<'e, E>(&self, executor: E, event: &WebhookEvent) -> Result<EventId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO webhook_events (
                id, endpoint_id, event_type, payload, last_attempt, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7
            )
            RETURNING id
            "#,
        )
        .bind(event.id)
        .bind(event.endpoint_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(&event.last_attempt)
        .bind(event.created_at)
        .bind(event.updated_at)
        .fetch_one(executor)
        .await?;

        Ok(id)
    }

    /// Finds a webhook event by ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails. A missing event is `Ok(None)`.
    pub async fn find_by_id(&self, event_id: EventId) -> Result<Option<WebhookEvent>> {
        let event = sqlx::query_as::<_, WebhookEvent>(
            r#"
            SELECT id, endpoint_id, event_type, payload, last_attempt, created_at, updated_at
            FROM webhook_events
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(event)
    }

    /// Replaces the event's attempt record with `record`.
    ///
    /// Whole-field replacement: writing the same record twice leaves the same
    /// row, and concurrent writers resolve as last-write-wins.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the event no longer exists, or a
    /// database error if the update fails.
    pub async fn save_attempt(&self, event_id: EventId, record: &AttemptRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
            SET last_attempt = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .bind(record)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(crate::error::CoreError::NotFound(format!("webhook event {event_id}")));
        }

        Ok(())
    }
}
