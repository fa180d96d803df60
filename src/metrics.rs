#![forbid(unsafe_code)]
//! Metrics recording utilities.
//!
//! Thin free functions over the `metrics` facade; exporters are the host
//! application's concern.

use std::time::Duration;

use metrics::{counter, gauge, histogram};

/// Classification of a head query for metering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetOutcome {
    /// The journal head is fully replicated (`Valid(Empty)`).
    Replicated,
    /// Pending entries exist beyond the durable store (`Valid(NonEmpty)`).
    NotReplicated,
    /// The cache could not answer; ask the durable store.
    Invalid,
    /// The query itself failed.
    Failure,
}

impl GetOutcome {
    /// Stable label value for this outcome.
    pub fn as_str(&self) -> &'static str {
        match self {
            GetOutcome::Replicated => "replicated",
            GetOutcome::NotReplicated => "not_replicated",
            GetOutcome::Invalid => "invalid",
            GetOutcome::Failure => "failure",
        }
    }
}

/// Record a head query with its latency and outcome.
pub fn record_get(topic: &str, outcome: GetOutcome, duration: Duration) {
    let labels = [
        ("topic", topic.to_string()),
        ("outcome", outcome.as_str().to_string()),
    ];
    counter!("headstream_gets_total", &labels).increment(1);
    histogram!("headstream_get_duration_seconds", &labels).record(duration.as_secs_f64());
}

/// Record the number of pending listeners for a topic.
pub fn record_listeners(topic: &str, size: usize) {
    let labels = [("topic", topic.to_string())];
    gauge!("headstream_listeners", &labels).set(size as f64);
}

/// Record one ingest round: entries merged, listeners outstanding, and the
/// delivery latency of the oldest record in the batch.
pub fn record_round(topic: &str, entries: usize, listeners: usize, delivery_latency: Duration) {
    let labels = [("topic", topic.to_string())];
    counter!("headstream_rounds_total", &labels).increment(1);
    histogram!("headstream_round_entries", &labels).record(entries as f64);
    gauge!("headstream_listeners", &labels).set(listeners as f64);
    histogram!("headstream_delivery_latency_seconds", &labels)
        .record(delivery_latency.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_labels_are_stable() {
        assert_eq!(GetOutcome::Replicated.as_str(), "replicated");
        assert_eq!(GetOutcome::NotReplicated.as_str(), "not_replicated");
        assert_eq!(GetOutcome::Invalid.as_str(), "invalid");
        assert_eq!(GetOutcome::Failure.as_str(), "failure");
    }

    #[test]
    fn test_recording_without_exporter_is_a_noop() {
        record_get("journal", GetOutcome::Replicated, Duration::from_millis(1));
        record_listeners("journal", 2);
        record_round("journal", 10, 2, Duration::from_millis(5));
    }
}
