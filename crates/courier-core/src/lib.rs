//! Core domain models, storage and time primitives.
//!
//! Provides strongly-typed identifiers, the webhook event / endpoint / job
//! entities, the persisted attempt record, and the PostgreSQL repositories
//! that every other courier crate builds on.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    AttemptRecord, DeliveryJob, Endpoint, EndpointId, EventId, JobId, JobStatus, Outcome,
    Settlement, WebhookEvent,
};
pub use time::{Clock, RealClock, TestClock};
