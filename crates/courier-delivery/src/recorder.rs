//! Attempt recorder.
//!
//! Persists the latest attempt onto its event. The write replaces the whole
//! field, so re-recording the same attempt is a no-op in effect and
//! concurrent writers resolve as last-write-wins.

use std::sync::Arc;

use courier_core::{AttemptRecord, EventId};
use tracing::debug;

use crate::{error::Result, storage::DeliveryStorage};

/// Writes attempt records through a [`DeliveryStorage`].
#[derive(Clone)]
pub struct AttemptRecorder {
    storage: Arc<dyn DeliveryStorage>,
}

impl AttemptRecorder {
    /// Creates a recorder over `storage`.
    pub fn new(storage: Arc<dyn DeliveryStorage>) -> Self {
        Self { storage }
    }

    /// Overwrites the attempt record of `event_id`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Persistence` if the write fails. The failure
    /// is never swallowed.
    pub async fn record(&self, event_id: EventId, record: AttemptRecord) -> Result<()> {
        let outcome = record.outcome();
        self.storage.save_attempt(event_id, record).await?;

        debug!(event_id = %event_id, outcome = %outcome, "attempt recorded");
        Ok(())
    }
}
