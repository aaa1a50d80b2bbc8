//! Webhook delivery worker and queue-driven delivery engine.
//!
//! A delivery invocation takes one event, checks the endpoint's
//! subscription, POSTs `{"event": .., "payload": ..}` under a hard timeout,
//! classifies the result, and overwrites the event's attempt record. The
//! invocation reports a [`DeliverySignal`] that the engine turns into a
//! queue action: complete, stop, reschedule with polynomial backoff, or give
//! up at the attempt ceiling.
//!
//! # Architecture
//!
//! - [`subscription`] - pure event-type matching
//! - [`client`] - bounded HTTP transport returning `Completed`/`Faulted`
//! - [`classify`] - transport result to `Delivered`/`Rejected`/`TimedOut`
//! - [`recorder`] - last-write-wins attempt persistence
//! - [`retry`] - `n^5 + jitter` backoff and the attempt ceiling
//! - [`worker`] - the per-event state machine
//! - [`engine`] / [`worker_pool`] - runners leasing jobs with
//!   `FOR UPDATE SKIP LOCKED` and settling them
//!
//! Delivery is at-least-once: a job whose lease expires mid-flight is run
//! again, so endpoints may see duplicates.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::{storage::Storage, RealClock};
//! use courier_delivery::{
//!     queue::PostgresJobQueue, storage::PostgresDeliveryStorage, DeliveryConfig, DeliveryEngine,
//!     DeliveryError,
//! };
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> std::result::Result<(), DeliveryError> {
//! let clock = Arc::new(RealClock::new());
//! let config = DeliveryConfig::default();
//! let storage = Arc::new(Storage::new(pool, clock.clone()));
//!
//! let mut engine = DeliveryEngine::new(
//!     Arc::new(PostgresDeliveryStorage::new(storage.clone())),
//!     Arc::new(PostgresJobQueue::new(storage, config.lease_duration)),
//!     config,
//!     clock,
//! )?;
//!
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod classify;
pub mod client;
pub mod engine;
pub mod error;
pub mod queue;
pub mod recorder;
pub mod retry;
pub mod storage;
pub mod subscription;
pub mod worker;
pub mod worker_pool;

pub use engine::{DeliveryConfig, DeliveryEngine, EngineStats, LEASE_MARGIN};
pub use error::{DeliveryError, Result};
pub use retry::{RetryDecision, RetryPolicy};
pub use worker::{DeliverySignal, DeliveryWorker, StopReason};

/// Default number of concurrent delivery runners.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default batch size for claiming jobs.
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Default attempt ceiling, including the initial attempt.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// User-Agent sent with every delivery.
pub const USER_AGENT: &str = "Courier-Webhook-Delivery/1.0";
