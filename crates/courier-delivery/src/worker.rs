//! Delivery worker: one invocation per event.
//!
//! ```text
//! Start -> Loaded -> Gated -> Sent -> Recorded -> Terminal(signal)
//!   |         |         |
//!   |         |         +-- not subscribed ----------> Stop
//!   |         +-- endpoint missing ------------------> Stop
//!   +-- event missing -------------------------------> Stop
//! ```
//!
//! Connection faults and non-2xx responses are ordinary outcomes: they are
//! recorded and reported as [`DeliverySignal::RetryableFailure`]. The only
//! error is a store failure, which is propagated so it is never mistaken for
//! a delivery failure.

use std::{fmt, sync::Arc};

use courier_core::{EventId, Outcome};
use tracing::{debug, info, warn};

use crate::{
    classify::{attempt_record, classify},
    client::DeliveryClient,
    error::Result,
    recorder::AttemptRecorder,
    storage::DeliveryStorage,
    subscription::is_subscribed,
};

/// Why an invocation ended without attempting delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopReason {
    /// The event no longer exists (or never did).
    EventNotFound,
    /// The event's endpoint no longer exists.
    EndpointNotFound,
    /// The endpoint does not subscribe to the event type.
    NotSubscribed,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EventNotFound => write!(f, "event not found"),
            Self::EndpointNotFound => write!(f, "endpoint not found"),
            Self::NotSubscribed => write!(f, "endpoint not subscribed to event type"),
        }
    }
}

/// Result of one delivery invocation, consumed by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverySignal {
    /// Delivered; the lifecycle is over.
    Success,
    /// Rejected or timed out; run again later if attempts remain.
    RetryableFailure(Outcome),
    /// Nothing to deliver; the lifecycle is over and nothing was recorded.
    Stop(StopReason),
}

impl DeliverySignal {
    /// Returns whether the scheduler should consider another attempt.
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::RetryableFailure(_))
    }
}

/// Orchestrates lookup, subscription gate, transport, classification and
/// recording for a single event.
///
/// Holds no per-event state, so one instance serves every concurrent
/// invocation.
#[derive(Clone)]
pub struct DeliveryWorker {
    storage: Arc<dyn DeliveryStorage>,
    client: Arc<DeliveryClient>,
    recorder: AttemptRecorder,
}

impl DeliveryWorker {
    /// Creates a worker over a data store and an HTTP client.
    pub fn new(storage: Arc<dyn DeliveryStorage>, client: Arc<DeliveryClient>) -> Self {
        let recorder = AttemptRecorder::new(storage.clone());
        Self { storage, client, recorder }
    }

    /// Runs one delivery invocation for `event_id`.
    ///
    /// Missing data and unmatched subscriptions end silently with
    /// [`DeliverySignal::Stop`]: nothing is sent or recorded. Otherwise
    /// exactly one request is made and its outcome replaces the event's
    /// attempt record before the signal is returned.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Persistence` if a lookup or the attempt write
    /// fails. When the write fails the request has already been sent.
    pub async fn deliver(&self, event_id: EventId) -> Result<DeliverySignal> {
        let Some(event) = self.storage.find_event(event_id).await? else {
            debug!(event_id = %event_id, "event not found, stopping");
            return Ok(DeliverySignal::Stop(StopReason::EventNotFound));
        };

        let Some(endpoint) = self.storage.find_endpoint(event.endpoint_id).await? else {
            debug!(
                event_id = %event_id,
                endpoint_id = %event.endpoint_id,
                "endpoint not found, stopping"
            );
            return Ok(DeliverySignal::Stop(StopReason::EndpointNotFound));
        };

        if !is_subscribed(&endpoint, &event.event_type) {
            debug!(
                event_id = %event_id,
                endpoint_id = %endpoint.id,
                event_type = %event.event_type,
                "endpoint not subscribed, stopping"
            );
            return Ok(DeliverySignal::Stop(StopReason::NotSubscribed));
        }

        let result = self.client.send(&endpoint.url, &event.event_type, &event.payload).await;
        let outcome = classify(&result);
        let record = attempt_record(result);
        let status_code = record.status_code();

        self.recorder.record(event.id, record).await?;

        if outcome.is_success() {
            info!(event_id = %event_id, status_code, "webhook delivered");
            Ok(DeliverySignal::Success)
        } else {
            warn!(event_id = %event_id, outcome = %outcome, status_code, "webhook delivery failed");
            Ok(DeliverySignal::RetryableFailure(outcome))
        }
    }
}
