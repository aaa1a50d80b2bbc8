//! Data store seam for the delivery worker.
//!
//! The worker needs three operations: look up an event, look up its
//! endpoint, and overwrite the event's attempt record. Production wraps
//! `courier_core::storage::Storage`; tests use [`mock::MockDeliveryStorage`].

use std::{future::Future, pin::Pin, sync::Arc};

use courier_core::{
    error::Result,
    models::{AttemptRecord, Endpoint, EndpointId, EventId, WebhookEvent},
};

/// Storage operations required by the delivery worker.
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Finds an event by ID. A missing event is `Ok(None)`.
    fn find_event(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<WebhookEvent>>> + Send + '_>>;

    /// Finds an endpoint by ID. A missing endpoint is `Ok(None)`.
    fn find_endpoint(
        &self,
        endpoint_id: EndpointId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Endpoint>>> + Send + '_>>;

    /// Replaces the event's attempt record.
    ///
    /// Whole-field replacement: the last write wins and repeated writes of
    /// the same record are indistinguishable from one.
    fn save_attempt(
        &self,
        event_id: EventId,
        record: AttemptRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Production storage implementation using PostgreSQL.
pub struct PostgresDeliveryStorage {
    storage: Arc<courier_core::storage::Storage>,
}

impl PostgresDeliveryStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<courier_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

impl DeliveryStorage for PostgresDeliveryStorage {
    fn find_event(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<WebhookEvent>>> + Send + '_>> {
        Box::pin(async move { self.storage.webhook_events.find_by_id(event_id).await })
    }

    fn find_endpoint(
        &self,
        endpoint_id: EndpointId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Endpoint>>> + Send + '_>> {
        Box::pin(async move { self.storage.endpoints.find_by_id(endpoint_id).await })
    }

    fn save_attempt(
        &self,
        event_id: EventId,
        record: AttemptRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move { self.storage.webhook_events.save_attempt(event_id, &record).await })
    }
}

pub mod mock {
    //! In-memory storage for exercising delivery logic without a database.
    //!
    //! Supports injecting lookup and write failures and counts attempt
    //! writes so tests can assert that nothing was recorded.

    use std::{
        collections::HashMap,
        future::Future,
        pin::Pin,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use courier_core::{error::Result, CoreError};
    use tokio::sync::RwLock;

    use super::{AttemptRecord, DeliveryStorage, Endpoint, EndpointId, EventId, WebhookEvent};

    /// Mock storage backed by hash maps.
    ///
    /// Clones share state, so a test can keep a handle after passing one to
    /// the worker.
    #[derive(Clone, Default)]
    pub struct MockDeliveryStorage {
        events: Arc<RwLock<HashMap<EventId, WebhookEvent>>>,
        endpoints: Arc<RwLock<HashMap<EndpointId, Endpoint>>>,
        find_error: Arc<RwLock<Option<String>>>,
        save_error: Arc<RwLock<Option<String>>>,
        save_count: Arc<AtomicUsize>,
    }

    impl MockDeliveryStorage {
        /// Creates a new mock storage with empty state.
        pub fn new() -> Self {
            Self::default()
        }

        /// Inserts or replaces an event.
        pub async fn add_event(&self, event: WebhookEvent) {
            self.events.write().await.insert(event.id, event);
        }

        /// Inserts or replaces an endpoint.
        pub async fn add_endpoint(&self, endpoint: Endpoint) {
            self.endpoints.write().await.insert(endpoint.id, endpoint);
        }

        /// Removes an event, simulating deletion between enqueue and run.
        pub async fn remove_event(&self, event_id: EventId) {
            self.events.write().await.remove(&event_id);
        }

        /// Makes every lookup fail with `message` until cleared.
        pub async fn fail_lookups(&self, message: Option<String>) {
            *self.find_error.write().await = message;
        }

        /// Makes every attempt write fail with `message` until cleared.
        pub async fn fail_saves(&self, message: Option<String>) {
            *self.save_error.write().await = message;
        }

        /// Returns the current attempt record of an event.
        pub async fn attempt_record(&self, event_id: EventId) -> Option<AttemptRecord> {
            self.events.read().await.get(&event_id).and_then(|e| e.last_attempt.clone())
        }

        /// Returns a snapshot of an event.
        pub async fn event(&self, event_id: EventId) -> Option<WebhookEvent> {
            self.events.read().await.get(&event_id).cloned()
        }

        /// Number of successful attempt writes so far.
        pub fn save_count(&self) -> usize {
            self.save_count.load(Ordering::SeqCst)
        }

        async fn check_find(&self) -> Result<()> {
            match self.find_error.read().await.as_ref() {
                Some(message) => Err(CoreError::Database(message.clone())),
                None => Ok(()),
            }
        }
    }

    impl DeliveryStorage for MockDeliveryStorage {
        fn find_event(
            &self,
            event_id: EventId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<WebhookEvent>>> + Send + '_>> {
            Box::pin(async move {
                self.check_find().await?;
                Ok(self.events.read().await.get(&event_id).cloned())
            })
        }

        fn find_endpoint(
            &self,
            endpoint_id: EndpointId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<Endpoint>>> + Send + '_>> {
            Box::pin(async move {
                self.check_find().await?;
                Ok(self.endpoints.read().await.get(&endpoint_id).cloned())
            })
        }

        fn save_attempt(
            &self,
            event_id: EventId,
            record: AttemptRecord,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                if let Some(message) = self.save_error.read().await.as_ref() {
                    return Err(CoreError::Database(message.clone()));
                }

                let mut events = self.events.write().await;
                let event = events
                    .get_mut(&event_id)
                    .ok_or_else(|| CoreError::NotFound(format!("webhook event {event_id}")))?;
                event.last_attempt = Some(record);
                event.updated_at = chrono::Utc::now();
                drop(events);

                self.save_count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }
}
