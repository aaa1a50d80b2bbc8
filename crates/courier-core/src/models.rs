//! Core domain models and strongly-typed identifiers.
//!
//! Defines webhook events, subscriber endpoints, the persisted attempt record
//! and delivery jobs, together with newtype ID wrappers and the database
//! encoding for each of them.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Marker stored in place of a response when the endpoint could not be
/// reached.
pub const TIMEOUT_ERROR_MARKER: &str = "TIMEOUT_ERROR";

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(uuid))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

uuid_id! {
    /// Strongly-typed event identifier.
    ///
    /// Events are created by the producing application and this ID follows
    /// them through every delivery attempt.
    ///
    /// # Example
    ///
    /// ```
    /// use courier_core::models::EventId;
    /// let event_id = EventId::new();
    /// println!("Delivering event: {}", event_id);
    /// ```
    EventId
}

uuid_id! {
    /// Strongly-typed endpoint identifier.
    EndpointId
}

uuid_id! {
    /// Strongly-typed delivery job identifier.
    ///
    /// One job drives the delivery lifecycle of exactly one event.
    JobId
}

/// Subscriber-owned destination for webhook events.
///
/// Endpoints are managed outside the delivery core; the worker only reads
/// them to find the URL and to check the subscription set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Endpoint {
    /// Unique identifier for this endpoint.
    pub id: EndpointId,

    /// Destination URL that receives the POST.
    pub url: String,

    /// Event-type matchers this endpoint wants to receive.
    ///
    /// Each entry is an exact event type, `*`, or a namespace wildcard such
    /// as `order.*`.
    pub subscribed_events: Vec<String>,

    /// When this endpoint was created.
    pub created_at: DateTime<Utc>,

    /// When this endpoint was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Endpoint {
    /// Creates an endpoint subscribed to the given event-type matchers.
    pub fn new<I, S>(url: impl Into<String>, subscribed_events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = Utc::now();
        Self {
            id: EndpointId::new(),
            url: url.into(),
            subscribed_events: subscribed_events.into_iter().map(Into::into).collect(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Webhook event produced by the application and awaiting delivery.
///
/// Everything except `last_attempt` is immutable once created. The attempt
/// record is replaced wholesale after every completed delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookEvent {
    /// Unique identifier for this event.
    pub id: EventId,

    /// Endpoint this event is addressed to (lookup only).
    pub endpoint_id: EndpointId,

    /// Name of the occurrence, e.g. `order.created`.
    pub event_type: String,

    /// Arbitrary JSON payload supplied by the producer.
    pub payload: serde_json::Value,

    /// Outcome of the most recently completed delivery attempt.
    ///
    /// `None` while the event has never been attempted.
    pub last_attempt: Option<AttemptRecord>,

    /// When the event was created.
    pub created_at: DateTime<Utc>,

    /// When the attempt record was last written.
    pub updated_at: DateTime<Utc>,
}

impl WebhookEvent {
    /// Creates a pending event with no attempt record.
    pub fn new(
        endpoint_id: EndpointId,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: EventId::new(),
            endpoint_id,
            event_type: event_type.into(),
            payload,
            last_attempt: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Classification of a completed delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The endpoint answered with a 2xx status.
    Delivered,
    /// The endpoint answered with any other status.
    Rejected,
    /// The endpoint could not be reached within the timeout.
    TimedOut,
}

impl Outcome {
    /// Returns whether the outcome ends the delivery lifecycle successfully.
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Delivered)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delivered => write!(f, "delivered"),
            Self::Rejected => write!(f, "rejected"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Snapshot of the latest delivery attempt, embedded in the event.
///
/// Persisted as `{"headers": {..}, "code": 200, "body": ".."}` for responses
/// and `{"error": "TIMEOUT_ERROR"}` when the endpoint was unreachable. The
/// `Delivered`/`Rejected` split is recovered from the status code on read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "StoredAttempt", try_from = "StoredAttempt")]
pub enum AttemptRecord {
    /// 2xx response.
    Delivered {
        /// Response headers.
        headers: BTreeMap<String, String>,
        /// HTTP status code.
        status_code: u16,
        /// Response body.
        body: String,
    },
    /// Non-2xx response.
    Rejected {
        /// Response headers.
        headers: BTreeMap<String, String>,
        /// HTTP status code.
        status_code: u16,
        /// Response body.
        body: String,
    },
    /// Connection-level failure, including timeouts.
    TimedOut,
}

impl AttemptRecord {
    /// Builds the record for a completed HTTP exchange.
    ///
    /// The status code alone decides between `Delivered` and `Rejected`.
    pub fn from_response(
        status_code: u16,
        headers: BTreeMap<String, String>,
        body: impl Into<String>,
    ) -> Self {
        let body = body.into();
        if (200..=299).contains(&status_code) {
            Self::Delivered { headers, status_code, body }
        } else {
            Self::Rejected { headers, status_code, body }
        }
    }

    /// Outcome kind of this record.
    pub const fn outcome(&self) -> Outcome {
        match self {
            Self::Delivered { .. } => Outcome::Delivered,
            Self::Rejected { .. } => Outcome::Rejected,
            Self::TimedOut => Outcome::TimedOut,
        }
    }

    /// HTTP status code, if the endpoint answered.
    pub const fn status_code(&self) -> Option<u16> {
        match self {
            Self::Delivered { status_code, .. } | Self::Rejected { status_code, .. } => {
                Some(*status_code)
            },
            Self::TimedOut => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum StoredAttempt {
    Response { headers: BTreeMap<String, String>, code: u16, body: String },
    Error { error: String },
}

impl From<AttemptRecord> for StoredAttempt {
    fn from(record: AttemptRecord) -> Self {
        match record {
            AttemptRecord::Delivered { headers, status_code, body }
            | AttemptRecord::Rejected { headers, status_code, body } => {
                Self::Response { headers, code: status_code, body }
            },
            AttemptRecord::TimedOut => Self::Error { error: TIMEOUT_ERROR_MARKER.to_string() },
        }
    }
}

impl TryFrom<StoredAttempt> for AttemptRecord {
    type Error = String;

    fn try_from(stored: StoredAttempt) -> Result<Self, Self::Error> {
        match stored {
            StoredAttempt::Response { headers, code, body } => {
                Ok(Self::from_response(code, headers, body))
            },
            StoredAttempt::Error { error } if error == TIMEOUT_ERROR_MARKER => Ok(Self::TimedOut),
            StoredAttempt::Error { error } => Err(format!("unknown attempt error marker: {error}")),
        }
    }
}

impl sqlx::Type<PgDb> for AttemptRecord {
    fn type_info() -> PgTypeInfo {
        <sqlx::types::Json<Self> as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for AttemptRecord {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let sqlx::types::Json(record) =
            <sqlx::types::Json<Self> as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(record)
    }
}

impl sqlx::Encode<'_, PgDb> for AttemptRecord {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <sqlx::types::Json<&Self> as sqlx::Encode<PgDb>>::encode_by_ref(
            &sqlx::types::Json(self),
            buf,
        )
    }
}

/// Delivery job lifecycle status.
///
/// ```text
/// Queued -> Completed            (delivered)
///        -> Stopped              (missing data, not subscribed)
///        -> Queued (rescheduled) (rejected / timed out, attempts remain)
///        -> Exhausted            (attempt ceiling reached)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its `run_at` time, or leased by a worker.
    Queued,
    /// Event delivered; terminal.
    Completed,
    /// Delivery not applicable (missing event/endpoint, not subscribed);
    /// terminal.
    Stopped,
    /// Attempt ceiling reached without success; terminal.
    Exhausted,
}

impl JobStatus {
    /// Returns whether the job will never run again.
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Queued)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Completed => write!(f, "completed"),
            Self::Stopped => write!(f, "stopped"),
            Self::Exhausted => write!(f, "exhausted"),
        }
    }
}

impl sqlx::Type<PgDb> for JobStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for JobStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "queued" => Ok(Self::Queued),
            "completed" => Ok(Self::Completed),
            "stopped" => Ok(Self::Stopped),
            "exhausted" => Ok(Self::Exhausted),
            _ => Err(format!("invalid job status: {s}").into()),
        }
    }
}

/// Result of settling a leased job.
///
/// Settling is guarded by the lease handed out at claim time. A runner whose
/// lease expired gets `LeaseLost` and must leave the job to its new holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// The job was updated.
    Applied,
    /// The job is no longer queued under the caller's lease. Nothing was
    /// written.
    LeaseLost,
}

/// Scheduled invocation of the delivery worker for one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryJob {
    /// Unique identifier for this job.
    pub id: JobId,

    /// Event to deliver.
    pub event_id: EventId,

    /// Delivery attempts already completed (successful or not).
    pub attempts: i32,

    /// Ceiling on delivery attempts, including the first one.
    pub max_attempts: i32,

    /// Current lifecycle status.
    pub status: JobStatus,

    /// Earliest time the job may run.
    pub run_at: DateTime<Utc>,

    /// Lease expiry while a worker holds the job.
    ///
    /// Also the lease token: settle operations must present the value the
    /// claim returned.
    pub locked_until: Option<DateTime<Utc>>,

    /// Last failure reason, for operators.
    pub last_error: Option<String>,

    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,

    /// When the job was last updated.
    pub updated_at: DateTime<Utc>,
}

impl DeliveryJob {
    /// Creates a queued job that is due immediately.
    pub fn new(event_id: EventId, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            event_id,
            attempts: 0,
            max_attempts: i32::try_from(max_attempts).unwrap_or(i32::MAX),
            status: JobStatus::Queued,
            run_at: now,
            locked_until: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Number of the attempt this job will make next (1-based).
    pub fn next_attempt_number(&self) -> u32 {
        u32::try_from(self.attempts).unwrap_or(0).saturating_add(1)
    }
}
