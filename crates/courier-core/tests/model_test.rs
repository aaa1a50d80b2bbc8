//! Integration tests for core domain models.
//!
//! Covers the persisted attempt record shape, job bookkeeping and the
//! clock abstraction, with property tests for the record encoding.

#![allow(clippy::unwrap_used)]

use std::{collections::BTreeMap, time::Duration};

use chrono::{TimeZone, Utc};
use courier_core::{
    models::TIMEOUT_ERROR_MARKER, AttemptRecord, Clock, DeliveryJob, Endpoint, EventId, JobStatus,
    Outcome, TestClock, WebhookEvent,
};
use proptest::{prelude::*, test_runner::Config as ProptestConfig};
use serde_json::json;

fn proptest_config() -> ProptestConfig {
    ProptestConfig { cases: 64, failure_persistence: None, ..ProptestConfig::default() }
}

fn headers_strategy() -> impl Strategy<Value = BTreeMap<String, String>> {
    prop::collection::btree_map(
        prop::string::string_regex("[a-z][a-z0-9-]{0,19}").unwrap(),
        prop::string::string_regex("[a-zA-Z0-9 ._/-]{0,40}").unwrap(),
        0..6,
    )
}

proptest! {
    #![proptest_config(proptest_config())]

    /// The status code alone decides the outcome and survives persistence.
    #[test]
    fn persisted_record_keeps_code_and_outcome(
        code in 100u16..600,
        headers in headers_strategy(),
        body in ".{0,200}",
    ) {
        let record = AttemptRecord::from_response(code, headers.clone(), body.clone());

        let value = serde_json::to_value(&record).unwrap();
        prop_assert_eq!(&value["code"], &json!(code));
        prop_assert_eq!(&value["body"], &json!(body));
        prop_assert_eq!(&value["headers"], &serde_json::to_value(&headers).unwrap());
        prop_assert!(value.get("error").is_none());

        let expected =
            if (200..300).contains(&code) { Outcome::Delivered } else { Outcome::Rejected };
        let restored: AttemptRecord = serde_json::from_value(value).unwrap();
        prop_assert_eq!(restored.outcome(), expected);
        prop_assert_eq!(restored, record);
    }

    /// Only the timeout marker is accepted as an error document.
    #[test]
    fn unknown_error_markers_are_refused(marker in "[A-Z_]{1,20}") {
        prop_assume!(marker != TIMEOUT_ERROR_MARKER);

        let result = serde_json::from_value::<AttemptRecord>(json!({"error": marker}));

        prop_assert!(result.is_err());
    }
}

#[test]
fn new_event_has_no_attempt_record() {
    let endpoint = Endpoint::new("https://example.com/hooks", ["order.*"]);
    let event = WebhookEvent::new(endpoint.id, "order.created", json!({"sku": "X"}));

    assert_eq!(event.endpoint_id, endpoint.id);
    assert_eq!(event.last_attempt, None);
    assert_eq!(event.payload, json!({"sku": "X"}));
    assert_eq!(endpoint.subscribed_events, vec!["order.*".to_string()]);
}

#[test]
fn event_round_trips_through_json_with_record() {
    let endpoint = Endpoint::new("https://example.com/hooks", ["*"]);
    let mut event = WebhookEvent::new(endpoint.id, "invoice.paid", json!(null));
    event.last_attempt = Some(AttemptRecord::TimedOut);

    let value = serde_json::to_value(&event).unwrap();
    assert_eq!(value["last_attempt"], json!({"error": "TIMEOUT_ERROR"}));

    let restored: WebhookEvent = serde_json::from_value(value).unwrap();
    assert_eq!(restored, event);
}

#[test]
fn job_attempt_numbering() {
    let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let mut job = DeliveryJob::new(EventId::new(), 3, now);

    assert_eq!(job.next_attempt_number(), 1);

    job.attempts = 2;
    assert_eq!(job.next_attempt_number(), 3);
    assert_eq!(job.created_at, now);
    assert_eq!(job.status, JobStatus::Queued);
}

#[test]
fn oversized_ceiling_is_clamped() {
    let job = DeliveryJob::new(EventId::new(), u32::MAX, Utc::now());

    assert_eq!(job.max_attempts, i32::MAX);
}

#[test]
fn job_status_serializes_snake_case() {
    assert_eq!(serde_json::to_value(JobStatus::Exhausted).unwrap(), json!("exhausted"));
    assert_eq!(serde_json::to_value(Outcome::TimedOut).unwrap(), json!("timed_out"));
    assert_eq!(Outcome::TimedOut.to_string(), "timed_out");
}

#[test]
fn test_clock_drives_utc_time() {
    let clock = TestClock::new();
    let start = clock.now_utc();

    clock.advance(Duration::from_secs(90));

    assert_eq!(clock.now_utc() - start, chrono::Duration::seconds(90));
}
