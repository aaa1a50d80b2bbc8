//! Outcome classification.
//!
//! Maps a transport result onto [`Outcome`] and builds the matching
//! [`AttemptRecord`]. Both functions are total.

use courier_core::{AttemptRecord, Outcome};

use crate::client::TransportResult;

/// Classifies a transport result.
///
/// `Completed` with a 2xx status is `Delivered`, any other status is
/// `Rejected`, and every fault is `TimedOut`.
pub fn classify(result: &TransportResult) -> Outcome {
    match result {
        TransportResult::Completed(response) if (200..=299).contains(&response.status_code) => {
            Outcome::Delivered
        },
        TransportResult::Completed(_) => Outcome::Rejected,
        TransportResult::Faulted { .. } => Outcome::TimedOut,
    }
}

/// Converts a transport result into the record to persist.
///
/// The record's outcome always agrees with [`classify`] on the same input.
pub fn attempt_record(result: TransportResult) -> AttemptRecord {
    match result {
        TransportResult::Completed(response) => {
            AttemptRecord::from_response(response.status_code, response.headers, response.body)
        },
        TransportResult::Faulted { .. } => AttemptRecord::TimedOut,
    }
}
