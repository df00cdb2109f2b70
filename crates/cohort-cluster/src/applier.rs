//! Event applier
//!
//! Turns inbound transaction events into evictions on the local cache.
//! Delivery is at-least-once and unordered, so application must be
//! idempotent and commutative: a delivery key is applied at most once, and
//! invalidation only ever evicts.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use cohort_core::types::{ServerId, TransactionEvent};
use cohort_core::CacheInvalidator;

use crate::metrics::ClusterMetrics;

/// Identity of a delivered event
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryKey {
    pub origin_server_id: ServerId,
    pub transaction_id: u64,
}

impl DeliveryKey {
    pub fn of(event: &TransactionEvent) -> Self {
        Self {
            origin_server_id: event.origin_server_id().to_string(),
            transaction_id: event.transaction_id(),
        }
    }
}

/// Bounded record of recently applied events
#[derive(Debug)]
pub struct DeliveryHistory {
    capacity: usize,
    horizon: Duration,
    seen: HashMap<DeliveryKey, Instant>,
    order: VecDeque<(DeliveryKey, Instant)>,
}

impl DeliveryHistory {
    pub fn new(capacity: usize, horizon: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            horizon,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Record `key`. Returns false if it was already recorded.
    pub fn record(&mut self, key: DeliveryKey, now: Instant) -> bool {
        self.evict_expired(now);

        if self.seen.contains_key(&key) {
            return false;
        }

        self.seen.insert(key.clone(), now);
        self.order.push_back((key, now));

        while self.order.len() > self.capacity {
            if let Some((oldest, _)) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }

        true
    }

    pub fn contains(&self, key: &DeliveryKey) -> bool {
        self.seen.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some((_, recorded_at)) = self.order.front() {
            if now.saturating_duration_since(*recorded_at) < self.horizon {
                break;
            }
            if let Some((key, _)) = self.order.pop_front() {
                self.seen.remove(&key);
            }
        }
    }
}

/// A table whose invalidation failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableFailure {
    pub table: String,
    pub reason: String,
}

/// Result of applying one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// First delivery; evictions were issued
    Applied {
        tables: usize,
        failures: Vec<TableFailure>,
    },
    /// Delivery key already applied
    Duplicate,
    /// Event originated from this instance
    OwnOrigin,
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. })
    }
}

/// Applies remote events to the local cache
pub struct EventApplier {
    local_server_id: ServerId,
    cache: Arc<dyn CacheInvalidator>,
    history: Mutex<DeliveryHistory>,
    metrics: Arc<ClusterMetrics>,
}

impl EventApplier {
    pub fn new(
        local_server_id: impl Into<ServerId>,
        cache: Arc<dyn CacheInvalidator>,
        history: DeliveryHistory,
        metrics: Arc<ClusterMetrics>,
    ) -> Self {
        Self {
            local_server_id: local_server_id.into(),
            cache,
            history: Mutex::new(history),
            metrics,
        }
    }

    pub fn apply(&self, event: &TransactionEvent) -> ApplyOutcome {
        self.apply_at(event, Instant::now())
    }

    pub fn apply_at(&self, event: &TransactionEvent, now: Instant) -> ApplyOutcome {
        if event.origin_server_id() == self.local_server_id {
            debug!(
                "Ignoring own event {}/{}",
                event.origin_server_id(),
                event.transaction_id()
            );
            return ApplyOutcome::OwnOrigin;
        }

        // check-and-record is a single critical section
        let first_delivery = self.history.lock().record(DeliveryKey::of(event), now);
        if !first_delivery {
            debug!(
                "Suppressed duplicate event {}/{}",
                event.origin_server_id(),
                event.transaction_id()
            );
            self.metrics.record_duplicate();
            return ApplyOutcome::Duplicate;
        }

        let mut failures = Vec::new();
        for change in event.table_changes() {
            let result = if change.bulk {
                self.cache.evict_table(&change.table)
            } else {
                let keys = change.affected_keys();
                if keys.is_empty() {
                    continue;
                }
                self.cache.evict_keys(&change.table, &keys)
            };

            if let Err(e) = result {
                warn!(
                    "Invalidation of table {} failed for event {}/{}: {}",
                    change.table,
                    event.origin_server_id(),
                    event.transaction_id(),
                    e
                );
                self.metrics.record_apply_failure(&change.table);
                failures.push(TableFailure {
                    table: change.table.clone(),
                    reason: e.to_string(),
                });
            }
        }

        debug!(
            "Applied event {}/{} touching {} tables",
            event.origin_server_id(),
            event.transaction_id(),
            event.table_changes().len()
        );

        ApplyOutcome::Applied {
            tables: event.table_changes().len(),
            failures,
        }
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }
}

impl std::fmt::Debug for EventApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventApplier")
            .field("local_server_id", &self.local_server_id)
            .field("history", &self.history_len())
            .finish()
    }
}
