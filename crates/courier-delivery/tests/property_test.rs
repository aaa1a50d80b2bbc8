//! Property-based tests for the delivery building blocks.
//!
//! Covers the backoff envelope, the attempt ceiling, last-write-wins
//! recording and lease exclusivity of the in-memory queue without any HTTP
//! traffic.

#![allow(clippy::unwrap_used)]

use std::{collections::HashSet, sync::Arc, time::Duration};

use courier_core::{AttemptRecord, Endpoint, JobId, TestClock, WebhookEvent};
use courier_delivery::{
    queue::{mock::InMemoryJobQueue, JobQueue},
    recorder::AttemptRecorder,
    storage::mock::MockDeliveryStorage,
    RetryDecision, RetryPolicy,
};
use proptest::prelude::*;
use rand::{rngs::StdRng, SeedableRng};
use serde_json::json;

fn attempt_record_strategy() -> impl Strategy<Value = AttemptRecord> {
    prop_oneof![
        1 => Just(AttemptRecord::TimedOut),
        4 => (
            100u16..600,
            prop::collection::btree_map("[a-z-]{1,12}", "[ -~]{0,24}", 0..4),
            "[ -~]{0,64}",
        )
            .prop_map(|(status, headers, body)| {
                AttemptRecord::from_response(status, headers, body)
            }),
    ]
}

proptest! {
    /// Every delay lies in `[n^5 + 30s, n^5 + 600s)`.
    #[test]
    fn backoff_stays_within_polynomial_envelope(attempt in 1u32..=40, seed in any::<u64>()) {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(seed);

        let delay = policy.next_delay_with(attempt, &mut rng);

        let base = Duration::from_secs(u64::from(attempt).pow(5));
        prop_assert!(delay >= base + Duration::from_secs(30));
        prop_assert!(delay < base + Duration::from_secs(600));
    }

    /// Retries continue exactly while fewer than `max_attempts` were made.
    #[test]
    fn ceiling_counts_the_initial_attempt(max_attempts in 1u32..=20, completed in 0u32..=40) {
        let policy = RetryPolicy::default().with_max_attempts(max_attempts);

        let decision = policy.decide(completed);

        if completed >= max_attempts {
            prop_assert!(matches!(decision, RetryDecision::GiveUp { .. }), "expected give up");
        } else {
            prop_assert!(matches!(decision, RetryDecision::Retry { .. }), "expected retry");
        }
    }

    /// The stored record is always the last one written.
    #[test]
    fn recorder_keeps_only_latest_record(
        records in prop::collection::vec(attempt_record_strategy(), 1..12),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let storage = MockDeliveryStorage::new();
            let endpoint = Endpoint::new("http://localhost/hook", ["*"]);
            let event = WebhookEvent::new(endpoint.id, "order.created", json!({}));
            let event_id = event.id;
            storage.add_endpoint(endpoint).await;
            storage.add_event(event).await;
            let recorder = AttemptRecorder::new(Arc::new(storage.clone()));

            for record in &records {
                recorder.record(event_id, record.clone()).await.unwrap();
            }

            prop_assert_eq!(storage.attempt_record(event_id).await, records.last().cloned());
            prop_assert_eq!(storage.save_count(), records.len());
            Ok(())
        })?;
    }

    /// Concurrent claims never hand out the same job twice.
    #[test]
    fn claims_are_disjoint_while_leased(
        job_count in 1usize..40,
        first_batch in 1usize..20,
        second_batch in 1usize..20,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let clock = TestClock::new();
            let queue = InMemoryJobQueue::new(Arc::new(clock), Duration::from_secs(300));
            for _ in 0..job_count {
                queue.enqueue(courier_core::EventId::new(), 10).await.unwrap();
            }

            let (first, second) =
                tokio::join!(queue.claim_due(first_batch), queue.claim_due(second_batch));
            let first = first.unwrap();
            let second = second.unwrap();

            let ids: HashSet<JobId> = first.iter().chain(second.iter()).map(|job| job.id).collect();
            prop_assert_eq!(ids.len(), first.len() + second.len());
            prop_assert_eq!(ids.len(), job_count.min(first_batch + second_batch));
            Ok(())
        })?;
    }
}
