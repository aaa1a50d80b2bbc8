//! Repository for endpoint database operations.
//!
//! Endpoints are owned by subscription management; the delivery path only
//! reads them. `create` exists for producers and test fixtures.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{Endpoint, EndpointId},
};

/// Repository for endpoint database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Creates a new endpoint.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails or constraints are violated.
    pub async fn create(&self, endpoint: &Endpoint) -> Result<EndpointId> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO webhook_endpoints (id, url, subscribed_events, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(endpoint.id)
        .bind(&endpoint.url)
        .bind(&endpoint.subscribed_events)
        .bind(endpoint.created_at)
        .bind(endpoint.updated_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Finds an endpoint by ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails. A missing endpoint is `Ok(None)`.
    pub async fn find_by_id(&self, endpoint_id: EndpointId) -> Result<Option<Endpoint>> {
        let endpoint = sqlx::query_as::<_, Endpoint>(
            r#"
            SELECT id, url, subscribed_events, created_at, updated_at
            FROM webhook_endpoints
            WHERE id = $1
            "#,
        )
        .bind(endpoint_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(endpoint)
    }
}
