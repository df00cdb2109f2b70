//! Cluster broadcast metrics
//!
//! Every counter is kept locally (for [`ClusterStats`]) and emitted through
//! the `metrics` facade, so a Prometheus exporter installed by the binary
//! picks them up.
//!
//! [`ClusterStats`]: cohort_core::types::ClusterStats

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};

use cohort_core::types::MemberState;

/// Metric names
pub mod names {
    pub const EVENTS_BROADCAST_TOTAL: &str = "cohort_events_broadcast_total";
    pub const EVENTS_RECEIVED_TOTAL: &str = "cohort_events_received_total";
    pub const DUPLICATES_SUPPRESSED_TOTAL: &str = "cohort_duplicates_suppressed_total";
    pub const SENDS_TOTAL: &str = "cohort_sends_total";
    pub const SEND_FAILURES_TOTAL: &str = "cohort_send_failures_total";
    pub const MALFORMED_FRAMES_TOTAL: &str = "cohort_malformed_frames_total";
    pub const APPLY_FAILURES_TOTAL: &str = "cohort_apply_failures_total";
    pub const BROADCASTS_SKIPPED_TOTAL: &str = "cohort_broadcasts_skipped_total";
    pub const MEMBER_REACHABLE: &str = "cohort_member_reachable";
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub events_broadcast: u64,
    pub events_received: u64,
    pub duplicates_suppressed: u64,
    pub send_failures: u64,
    pub malformed_frames: u64,
    pub apply_failures: u64,
    pub broadcasts_skipped: u64,
}

#[derive(Debug, Default)]
pub struct ClusterMetrics {
    events_broadcast: AtomicU64,
    events_received: AtomicU64,
    duplicates_suppressed: AtomicU64,
    send_failures: AtomicU64,
    malformed_frames: AtomicU64,
    apply_failures: AtomicU64,
    broadcasts_skipped: AtomicU64,
}

impl ClusterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_broadcast(&self) {
        self.events_broadcast.fetch_add(1, Ordering::Relaxed);
        counter!(names::EVENTS_BROADCAST_TOTAL).increment(1);
    }

    pub fn record_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
        counter!(names::EVENTS_RECEIVED_TOTAL).increment(1);
    }

    pub fn record_duplicate(&self) {
        self.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
        counter!(names::DUPLICATES_SUPPRESSED_TOTAL).increment(1);
    }

    pub fn record_send(&self, outcome: &'static str) {
        counter!(names::SENDS_TOTAL, "outcome" => outcome).increment(1);
    }

    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
        counter!(names::SEND_FAILURES_TOTAL).increment(1);
    }

    pub fn record_malformed(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
        counter!(names::MALFORMED_FRAMES_TOTAL).increment(1);
    }

    pub fn record_apply_failure(&self, table: &str) {
        self.apply_failures.fetch_add(1, Ordering::Relaxed);
        counter!(names::APPLY_FAILURES_TOTAL, "table" => table.to_string()).increment(1);
    }

    pub fn record_broadcast_skipped(&self) {
        self.broadcasts_skipped.fetch_add(1, Ordering::Relaxed);
        counter!(names::BROADCASTS_SKIPPED_TOTAL).increment(1);
    }

    pub fn record_member_state(&self, address: &str, state: MemberState) {
        let value = match state {
            MemberState::Reachable => 1.0,
            MemberState::Unknown => 0.5,
            MemberState::Unreachable => 0.0,
        };
        gauge!(names::MEMBER_REACHABLE, "member" => address.to_string()).set(value);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_broadcast: self.events_broadcast.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            duplicates_suppressed: self.duplicates_suppressed.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            apply_failures: self.apply_failures.load(Ordering::Relaxed),
            broadcasts_skipped: self.broadcasts_skipped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_without_recorder() {
        let metrics = ClusterMetrics::new();
        metrics.record_broadcast();
        metrics.record_received();
        metrics.record_received();
        metrics.record_duplicate();
        metrics.record_apply_failure("orders");
        metrics.record_member_state("10.0.0.2:9301", MemberState::Reachable);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.events_broadcast, 1);
        assert_eq!(snapshot.events_received, 2);
        assert_eq!(snapshot.duplicates_suppressed, 1);
        assert_eq!(snapshot.apply_failures, 1);
        assert_eq!(snapshot.send_failures, 0);
    }
}
