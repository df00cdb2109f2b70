//! Broadcast fan-out
//!
//! Sends one encoded frame to every eligible member in parallel:
//! - Serialization happens once per broadcast
//! - An event over the transport's frame limit goes out as table-level
//!   invalidation instead
//! - Every send runs in its own tracked task with its own timeout
//! - The caller waits at most the broadcast deadline
//! - Sends that outlive the deadline finish in the background and only
//!   update member state and metrics

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::codec::{encode_frame, Frame};
use crate::metrics::ClusterMetrics;
use crate::registry::MemberRegistry;
use crate::transport::BroadcastTransport;

/// Result of one send to one member
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    Failed(String),
    TimedOut,
}

impl SendOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, SendOutcome::Delivered)
    }

    /// Label used for the `outcome` metric dimension
    pub fn label(&self) -> &'static str {
        match self {
            SendOutcome::Delivered => "delivered",
            SendOutcome::Failed(_) => "failed",
            SendOutcome::TimedOut => "timed_out",
        }
    }
}

/// What happened to one broadcast by the time the caller got control back
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sends that finished before the deadline
    pub outcomes: Vec<(String, SendOutcome)>,
    /// Members still being sent to when the deadline passed
    pub abandoned: Vec<String>,
    /// Members left out because they are in a backoff window
    pub skipped: Vec<String>,
}

impl BroadcastReport {
    pub fn outcome(&self, address: &str) -> Option<&SendOutcome> {
        self.outcomes
            .iter()
            .find(|(member, _)| member == address)
            .map(|(_, outcome)| outcome)
    }

    pub fn delivered(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_delivered()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.delivered()
    }

    /// Every targeted member answered before the deadline
    pub fn is_complete(&self) -> bool {
        self.abandoned.is_empty()
    }

    /// Nothing was attempted
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty() && self.abandoned.is_empty()
    }
}

pub struct Broadcaster {
    transport: Arc<dyn BroadcastTransport>,
    registry: Arc<MemberRegistry>,
    metrics: Arc<ClusterMetrics>,
    send_timeout: Duration,
    deadline: Duration,
    tasks: TaskTracker,
}

impl Broadcaster {
    pub fn new(
        transport: Arc<dyn BroadcastTransport>,
        registry: Arc<MemberRegistry>,
        metrics: Arc<ClusterMetrics>,
        send_timeout: Duration,
        deadline: Duration,
    ) -> Self {
        Self {
            transport,
            registry,
            metrics,
            send_timeout,
            deadline,
            tasks: TaskTracker::new(),
        }
    }

    /// Send `frame` to every eligible member
    pub async fn broadcast(&self, frame: &Frame) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        let encoded = match self.encode_within_limit(frame) {
            Some(encoded) => encoded,
            None => return report,
        };

        let eligibility = self.registry.eligible();
        report.skipped = eligibility.skipped;
        if !report.skipped.is_empty() {
            debug!("Skipping members in backoff: {:?}", report.skipped);
        }
        if eligibility.targets.is_empty() {
            return report;
        }

        // senders may outlive the receiver once the deadline passes
        let (tx, mut rx) = mpsc::unbounded_channel();
        for address in &eligibility.targets {
            let tx = tx.clone();
            let address = address.clone();
            let frame = encoded.clone();
            let transport = Arc::clone(&self.transport);
            let registry = Arc::clone(&self.registry);
            let metrics = Arc::clone(&self.metrics);
            let send_timeout = self.send_timeout;

            self.tasks.spawn(async move {
                let outcome =
                    Self::deliver(&*transport, &registry, &metrics, &address, frame, send_timeout)
                        .await;
                let _ = tx.send((address, outcome));
            });
        }
        drop(tx);

        let mut pending: BTreeSet<String> = eligibility.targets.into_iter().collect();
        let deadline = tokio::time::sleep(self.deadline);
        tokio::pin!(deadline);

        while !pending.is_empty() {
            tokio::select! {
                _ = &mut deadline => break,
                received = rx.recv() => match received {
                    Some((address, outcome)) => {
                        pending.remove(&address);
                        report.outcomes.push((address, outcome));
                    }
                    None => break,
                },
            }
        }

        if !pending.is_empty() {
            debug!(
                "Broadcast deadline of {:?} passed with {} sends in flight",
                self.deadline,
                pending.len()
            );
        }
        report.abandoned = pending.into_iter().collect();
        report
    }

    /// Encode `frame` once. An event too large for the transport is
    /// widened to table-level changes; `None` means nothing can be sent.
    fn encode_within_limit(&self, frame: &Frame) -> Option<Bytes> {
        let encoded = match encode_frame(frame) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("Failed to encode {} frame: {}", frame.name(), e);
                return None;
            }
        };

        let limit = self.transport.max_frame_bytes();
        if encoded.len() <= limit {
            return Some(encoded);
        }

        let event = match frame {
            Frame::Event(event) => event,
            other => {
                error!(
                    "{} frame of {} bytes exceeds transport limit of {} bytes",
                    other.name(),
                    encoded.len(),
                    limit
                );
                return None;
            }
        };

        let widened = event.to_table_level();
        match encode_frame(&Frame::Event(widened)) {
            Ok(table_level) if table_level.len() <= limit => {
                warn!(
                    "Event {} from {} is {} bytes, over the {} byte limit; invalidating tables {:?} instead",
                    event.transaction_id(),
                    event.origin_server_id(),
                    encoded.len(),
                    limit,
                    event.tables()
                );
                Some(table_level)
            }
            Ok(table_level) => {
                error!(
                    "Event {} from {} does not fit the {} byte limit even as table-level invalidation ({} bytes)",
                    event.transaction_id(),
                    event.origin_server_id(),
                    limit,
                    table_level.len()
                );
                None
            }
            Err(e) => {
                error!("Failed to encode table-level event: {}", e);
                None
            }
        }
    }

    async fn deliver(
        transport: &dyn BroadcastTransport,
        registry: &MemberRegistry,
        metrics: &ClusterMetrics,
        address: &str,
        frame: Bytes,
        send_timeout: Duration,
    ) -> SendOutcome {
        let outcome = match tokio::time::timeout(send_timeout, transport.send(address, frame)).await
        {
            Ok(Ok(())) => {
                registry.mark_success(address);
                SendOutcome::Delivered
            }
            // nothing reached the member, so its reachability is unchanged
            Ok(Err(e)) if e.is_local() => {
                warn!("Send to member {} not attempted: {}", address, e);
                registry.release_probe(address);
                SendOutcome::Failed(e.to_string())
            }
            Ok(Err(e)) => {
                warn!("Send to member {} failed: {}", address, e);
                registry.mark_failure(address);
                metrics.record_send_failure();
                SendOutcome::Failed(e.to_string())
            }
            Err(_) => {
                warn!("Send to member {} timed out after {:?}", address, send_timeout);
                registry.mark_failure(address);
                metrics.record_send_failure();
                SendOutcome::TimedOut
            }
        };

        metrics.record_send(outcome.label());
        if let Some(member) = registry.get(address) {
            metrics.record_member_state(address, member.state);
        }
        outcome
    }

    /// Wait up to `grace` for sends still in flight. Returns false if some
    /// had to be abandoned.
    pub async fn flush(&self, grace: Duration) -> bool {
        self.tasks.close();
        let drained = tokio::time::timeout(grace, self.tasks.wait()).await.is_ok();
        if !drained {
            warn!(
                "Abandoning {} in-flight sends after {:?}",
                self.tasks.len(),
                grace
            );
        }
        drained
    }

    /// Sends currently running, including ones past their broadcast deadline
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("transport", &self.transport.kind())
            .field("send_timeout", &self.send_timeout)
            .field("deadline", &self.deadline)
            .field("in_flight", &self.tasks.len())
            .finish()
    }
}
