//! Cluster manager - the entry point used by the persistence layer
//!
//! Responsibilities:
//! - Own the member registry, transport, broadcaster and event applier
//! - Drive the `Created -> Running -> Stopped` lifecycle
//! - Turn committed table changes into broadcast events
//! - Dispatch inbound frames to the applier and the registry

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use cohort_core::types::{
    ClusterConfig, ClusterStats, ManagerState, ServerId, TableChange, TransactionEvent,
    TransportKind,
};
use cohort_core::CacheInvalidator;

use crate::applier::{DeliveryHistory, EventApplier};
use crate::broadcaster::{BroadcastReport, Broadcaster};
use crate::codec::{Frame, MemberNotice};
use crate::error::{ClusterError, ClusterResult};
use crate::metrics::ClusterMetrics;
use crate::registry::{ClusterMember, MemberRegistry};
use crate::transport::{self, BroadcastTransport, FrameHandler};

/// The main cluster manager
pub struct ClusterManager {
    /// Cluster configuration
    config: ClusterConfig,
    /// Lifecycle state, shared with the inbound dispatcher
    state: Arc<RwLock<ManagerState>>,
    /// Serializes startup and shutdown
    lifecycle: tokio::sync::Mutex<()>,
    /// Address the listener is bound to
    bound_address: RwLock<Option<SocketAddr>>,
    registry: Arc<MemberRegistry>,
    transport: Arc<dyn BroadcastTransport>,
    broadcaster: Broadcaster,
    applier: Arc<EventApplier>,
    metrics: Arc<ClusterMetrics>,
}

impl ClusterManager {
    /// Create a manager using the transport named by `config.transport`
    pub fn new(config: ClusterConfig, cache: Arc<dyn CacheInvalidator>) -> ClusterResult<Self> {
        let transport = transport::from_config(&config);
        Self::with_transport(config, cache, transport)
    }

    /// Create a manager on top of an existing transport
    pub fn with_transport(
        config: ClusterConfig,
        cache: Arc<dyn CacheInvalidator>,
        transport: Arc<dyn BroadcastTransport>,
    ) -> ClusterResult<Self> {
        config.validate()?;

        let metrics = Arc::new(ClusterMetrics::new());
        let registry = Arc::new(MemberRegistry::new(
            config.members.iter().cloned(),
            config.advertise_address.clone(),
            config.backoff(),
        ));
        let broadcaster = Broadcaster::new(
            Arc::clone(&transport),
            Arc::clone(&registry),
            Arc::clone(&metrics),
            config.send_timeout(),
            config.broadcast_deadline(),
        );
        let applier = Arc::new(EventApplier::new(
            config.server_id.clone(),
            cache,
            DeliveryHistory::new(config.dedup_capacity, config.dedup_horizon()),
            Arc::clone(&metrics),
        ));

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(ManagerState::Created)),
            lifecycle: tokio::sync::Mutex::new(()),
            bound_address: RwLock::new(None),
            registry,
            transport,
            broadcaster,
            applier,
            metrics,
        })
    }

    pub fn builder() -> ClusterManagerBuilder {
        ClusterManagerBuilder::new()
    }

    /// Open the listening endpoint and announce this member to its peers.
    /// Returns the bound address.
    pub async fn startup(&self) -> ClusterResult<SocketAddr> {
        let _lifecycle = self.lifecycle.lock().await;

        let state = self.state();
        if state != ManagerState::Created {
            return Err(ClusterError::InvalidState(state));
        }

        info!(
            "Starting cluster member {} ({} transport, {} configured members)",
            self.config.server_id,
            self.transport.kind(),
            self.registry.len()
        );

        let bound = self.transport.listen(Arc::new(self.dispatcher())).await?;

        let advertised = self
            .config
            .advertise_address
            .clone()
            .unwrap_or_else(|| advertise_address_for(bound));
        self.registry.set_local_address(advertised.clone());
        *self.bound_address.write() = Some(bound);
        *self.state.write() = ManagerState::Running;

        info!(
            "Cluster member {} running on {} (advertised as {})",
            self.config.server_id, bound, advertised
        );

        let report = self
            .broadcaster
            .broadcast(&Frame::Hello(self.notice(advertised)))
            .await;
        debug!(
            "Join notice reached {} of {} members",
            report.delivered(),
            self.registry.len()
        );

        Ok(bound)
    }

    /// Announce departure, wait for in-flight sends and close the listener.
    /// Calling it again, or on a manager that never started, does nothing.
    pub async fn shutdown(&self) -> ClusterResult<()> {
        let _lifecycle = self.lifecycle.lock().await;

        let previous = std::mem::replace(&mut *self.state.write(), ManagerState::Stopped);
        match previous {
            ManagerState::Stopped => return Ok(()),
            ManagerState::Created => {
                info!("Cluster member {} stopped before startup", self.config.server_id);
                return Ok(());
            }
            ManagerState::Running => {}
        }

        info!("Stopping cluster member {}", self.config.server_id);

        if let Some(advertised) = self.registry.local_address() {
            let report = self
                .broadcaster
                .broadcast(&Frame::Leave(self.notice(advertised)))
                .await;
            debug!("Leave notice reached {} members", report.delivered());
        }

        self.broadcaster.flush(self.config.shutdown_grace()).await;
        self.transport.close().await;

        info!("Cluster member {} stopped", self.config.server_id);
        Ok(())
    }

    /// Send `event` to every reachable member. Never fails: per-member
    /// results are in the returned report.
    pub async fn broadcast(&self, event: TransactionEvent) -> BroadcastReport {
        let state = self.state();
        if state != ManagerState::Running {
            warn!(
                "Not broadcasting event {}/{}: cluster member is {:?}",
                event.origin_server_id(),
                event.transaction_id(),
                state
            );
            self.metrics.record_broadcast_skipped();
            return BroadcastReport::default();
        }

        if event.is_empty() {
            debug!("Not broadcasting empty event {}", event.transaction_id());
            return BroadcastReport::default();
        }

        debug!(
            "Broadcasting event {}/{} for tables {:?}",
            event.origin_server_id(),
            event.transaction_id(),
            event.tables()
        );
        self.metrics.record_broadcast();
        self.broadcaster.broadcast(&Frame::Event(event)).await
    }

    /// Hook for a committed transaction: broadcast its table changes under
    /// the local server id. Changes without keys are dropped.
    pub async fn notify_commit(
        &self,
        table_changes: Vec<TableChange>,
        transaction_id: u64,
    ) -> BroadcastReport {
        let changes: Vec<TableChange> = table_changes
            .into_iter()
            .filter(|change| !change.is_empty())
            .collect();
        if changes.is_empty() {
            debug!("Transaction {} changed nothing cacheable", transaction_id);
            return BroadcastReport::default();
        }

        let event = TransactionEvent::new(self.config.server_id.clone(), transaction_id, changes);
        self.broadcast(event).await
    }

    /// Register a member at runtime. Returns false if it is local or known.
    pub fn add_member(&self, address: &str) -> bool {
        self.registry.add_member(address)
    }

    /// Replace the member list, keeping state for members that remain
    pub fn reconfigure(&self, addresses: &[String]) {
        self.registry.reconfigure(addresses);
    }

    pub fn members(&self) -> Vec<ClusterMember> {
        self.registry.members()
    }

    pub fn stats(&self) -> ClusterStats {
        let snapshot = self.metrics.snapshot();
        ClusterStats {
            server_id: self.config.server_id.clone(),
            state: self.state(),
            events_broadcast: snapshot.events_broadcast,
            events_received: snapshot.events_received,
            duplicates_suppressed: snapshot.duplicates_suppressed,
            send_failures: snapshot.send_failures,
            malformed_frames: snapshot.malformed_frames,
            apply_failures: snapshot.apply_failures,
            broadcasts_skipped: snapshot.broadcasts_skipped,
            members: self.registry.statuses(),
        }
    }

    pub fn state(&self) -> ManagerState {
        *self.state.read()
    }

    /// Address the listener is bound to, once started
    pub fn local_address(&self) -> Option<SocketAddr> {
        *self.bound_address.read()
    }

    /// Address peers know this member by
    pub fn advertised_address(&self) -> Option<String> {
        self.registry.local_address()
    }

    pub fn server_id(&self) -> &str {
        &self.config.server_id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    fn dispatcher(&self) -> InboundDispatcher {
        InboundDispatcher {
            server_id: self.config.server_id.clone(),
            state: Arc::clone(&self.state),
            applier: Arc::clone(&self.applier),
            registry: Arc::clone(&self.registry),
            metrics: Arc::clone(&self.metrics),
            accept_joins: self.config.accept_joins,
        }
    }

    fn notice(&self, address: String) -> MemberNotice {
        MemberNotice {
            server_id: self.config.server_id.clone(),
            address,
        }
    }
}

/// Default advertised address: the bound address, with a wildcard IP
/// replaced by the host name
fn advertise_address_for(bound: SocketAddr) -> String {
    if !bound.ip().is_unspecified() {
        return bound.to_string();
    }
    match hostname::get() {
        Ok(name) => format!("{}:{}", name.to_string_lossy(), bound.port()),
        Err(e) => {
            warn!("Could not resolve host name, advertising {}: {}", bound, e);
            bound.to_string()
        }
    }
}

impl std::fmt::Debug for ClusterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterManager")
            .field("server_id", &self.config.server_id)
            .field("state", &self.state())
            .field("transport", &self.transport.kind())
            .field("members", &self.registry.len())
            .finish()
    }
}

/// Routes inbound frames to the applier and the registry
struct InboundDispatcher {
    server_id: ServerId,
    state: Arc<RwLock<ManagerState>>,
    applier: Arc<EventApplier>,
    registry: Arc<MemberRegistry>,
    metrics: Arc<ClusterMetrics>,
    accept_joins: bool,
}

impl FrameHandler for InboundDispatcher {
    fn handle_frame(&self, frame: Frame, peer: SocketAddr) {
        if *self.state.read() == ManagerState::Stopped {
            debug!("Ignoring {} frame from {}: stopped", frame.name(), peer);
            return;
        }

        match frame {
            Frame::Event(event) => {
                if event.origin_server_id() == self.server_id {
                    debug!(
                        "Ignoring own event {} echoed back by {}",
                        event.transaction_id(),
                        peer
                    );
                    return;
                }
                self.metrics.record_received();
                self.applier.apply(&event);
            }
            Frame::Hello(notice) => {
                if self.registry.mark_online(&notice.address, self.accept_joins) {
                    debug!("Join notice from {} at {}", notice.server_id, notice.address);
                    if let Some(member) = self.registry.get(&notice.address) {
                        self.metrics.record_member_state(&notice.address, member.state);
                    }
                } else {
                    debug!(
                        "Ignoring join notice from unregistered member {} at {}",
                        notice.server_id, notice.address
                    );
                }
            }
            Frame::Leave(notice) => {
                self.registry.mark_departed(&notice.address);
                if let Some(member) = self.registry.get(&notice.address) {
                    self.metrics.record_member_state(&notice.address, member.state);
                }
            }
            Frame::Ack | Frame::Nack(_) => {}
        }
    }

    fn handle_malformed(&self, peer: SocketAddr, error: &ClusterError) {
        self.metrics.record_malformed();
        warn!("Discarded malformed frame from {}: {}", peer, error);
    }
}

/// Builder for ClusterManager
pub struct ClusterManagerBuilder {
    config: ClusterConfig,
    cache: Option<Arc<dyn CacheInvalidator>>,
    transport: Option<Arc<dyn BroadcastTransport>>,
}

impl ClusterManagerBuilder {
    /// Create a new builder with default config
    pub fn new() -> Self {
        Self {
            config: ClusterConfig::default(),
            cache: None,
            transport: None,
        }
    }

    /// Start from an existing configuration
    pub fn config(mut self, config: ClusterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn server_id(mut self, id: impl Into<ServerId>) -> Self {
        self.config.server_id = id.into();
        self
    }

    pub fn bind_address(mut self, address: impl Into<String>) -> Self {
        self.config.bind_address = address.into();
        self
    }

    pub fn advertise_address(mut self, address: impl Into<String>) -> Self {
        self.config.advertise_address = Some(address.into());
        self
    }

    pub fn members(mut self, members: Vec<String>) -> Self {
        self.config.members = members;
        self
    }

    pub fn transport_kind(mut self, kind: TransportKind) -> Self {
        self.config.transport = kind;
        self
    }

    pub fn broadcast_deadline(mut self, deadline: Duration) -> Self {
        self.config.broadcast_deadline_ms = deadline.as_millis() as u64;
        self
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.config.send_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Cache that remote events are applied to
    pub fn cache(mut self, cache: Arc<dyn CacheInvalidator>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Use this transport instead of the configured variant
    pub fn transport(mut self, transport: Arc<dyn BroadcastTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build the cluster manager
    pub fn build(self) -> ClusterResult<ClusterManager> {
        let cache = self.cache.ok_or_else(|| {
            ClusterError::InvalidConfig("a cache invalidator is required".to_string())
        })?;
        match self.transport {
            Some(transport) => ClusterManager::with_transport(self.config, cache, transport),
            None => ClusterManager::new(self.config, cache),
        }
    }
}

impl Default for ClusterManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::SendOutcome;
    use cohort_core::types::{MemberState, PkValue};
    use cohort_core::MemoryCache;
    use std::time::Instant;

    struct Node {
        manager: ClusterManager,
        cache: Arc<MemoryCache<String>>,
        address: String,
    }

    fn test_config(server_id: &str) -> ClusterConfig {
        ClusterConfig {
            server_id: server_id.to_string(),
            bind_address: "127.0.0.1:0".to_string(),
            send_timeout_ms: 2_000,
            broadcast_deadline_ms: 3_000,
            shutdown_grace_ms: 500,
            connect_timeout_ms: 500,
            ack_timeout_ms: 200,
            retry_base_delay_ms: 10,
            ..Default::default()
        }
    }

    async fn start_node(config: ClusterConfig) -> Node {
        let cache = Arc::new(MemoryCache::new());
        let manager = ClusterManager::new(config, cache.clone()).unwrap();
        let address = manager.startup().await.unwrap().to_string();
        Node {
            manager,
            cache,
            address,
        }
    }

    /// Make every node a member of every other node
    fn connect(nodes: &[&Node]) {
        for node in nodes {
            for peer in nodes {
                if node.address != peer.address {
                    assert!(node.manager.add_member(&peer.address));
                }
            }
        }
    }

    fn orders_42() -> PkValue {
        PkValue::from(42)
    }

    fn unused_address() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let started = Instant::now();
        while !condition() {
            assert!(
                started.elapsed() < Duration::from_secs(5),
                "condition not met in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_builder() {
        let manager = ClusterManagerBuilder::new()
            .server_id("node-1")
            .bind_address("127.0.0.1:0")
            .members(vec!["10.0.0.2:9301".to_string()])
            .cache(Arc::new(MemoryCache::<String>::new()))
            .build()
            .unwrap();

        assert_eq!(manager.server_id(), "node-1");
        assert_eq!(manager.state(), ManagerState::Created);
        assert_eq!(manager.members().len(), 1);
    }

    #[test]
    fn test_builder_requires_cache() {
        let result = ClusterManagerBuilder::new().server_id("node-1").build();
        assert!(matches!(result, Err(ClusterError::InvalidConfig(_))));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ClusterConfig {
            failure_threshold: 0,
            ..test_config("node-1")
        };
        let result = ClusterManager::new(config, Arc::new(MemoryCache::<String>::new()));
        assert!(matches!(result, Err(ClusterError::Core(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_commit_invalidates_every_peer() {
        let a = start_node(test_config("node-a")).await;
        let b = start_node(test_config("node-b")).await;
        let c = start_node(test_config("node-c")).await;
        connect(&[&a, &b, &c]);

        for node in [&a, &b, &c] {
            node.cache.put("orders", 42, "pending".to_string());
            node.cache.put("orders", 43, "shipped".to_string());
        }

        let report = a
            .manager
            .notify_commit(vec![TableChange::new("orders").update(42)], 1)
            .await;

        assert_eq!(report.delivered(), 2);
        assert!(report.is_complete());
        assert!(!b.cache.contains("orders", &orders_42()));
        assert!(!c.cache.contains("orders", &orders_42()));
        // untouched keys and the origin's own cache are left alone
        assert!(b.cache.contains("orders", &PkValue::from(43)));
        assert!(a.cache.contains("orders", &orders_42()));

        assert_eq!(a.manager.stats().events_broadcast, 1);
        assert_eq!(b.manager.stats().events_received, 1);
        assert_eq!(a.manager.stats().reachable_members(), 2);

        for node in [&a, &b, &c] {
            node.manager.shutdown().await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_killed_member_does_not_block_others() {
        let a = start_node(test_config("node-a")).await;
        let b = start_node(test_config("node-b")).await;
        let c = start_node(test_config("node-c")).await;
        connect(&[&a, &b, &c]);
        c.cache.put("orders", 42, "pending".to_string());

        // crash: the listener goes away without a leave notice
        b.manager.transport.close().await;

        let report = a
            .manager
            .notify_commit(vec![TableChange::new("orders").delete(42)], 2)
            .await;

        assert!(matches!(report.outcome(&b.address), Some(SendOutcome::Failed(_))));
        assert_eq!(report.outcome(&c.address), Some(&SendOutcome::Delivered));
        assert!(!c.cache.contains("orders", &orders_42()));

        let members = a.manager.members();
        let member_b = members.iter().find(|m| m.address == b.address).unwrap();
        assert_eq!(member_b.state, MemberState::Unreachable);
        assert_eq!(member_b.consecutive_failures, 1);
        assert_eq!(a.manager.stats().send_failures, 1);

        a.manager.shutdown().await.unwrap();
        c.manager.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_duplicate_event_applied_once() {
        let a = start_node(test_config("node-a")).await;
        let b = start_node(test_config("node-b")).await;
        connect(&[&a, &b]);

        let event = TransactionEvent::new("node-a", 7, vec![TableChange::new("orders").update(42)]);

        b.cache.put("orders", 42, "v1".to_string());
        a.manager.broadcast(event.clone()).await;
        assert!(!b.cache.contains("orders", &orders_42()));

        // re-cached between the two deliveries; the resend must not evict it
        b.cache.put("orders", 42, "v2".to_string());
        let report = a.manager.broadcast(event).await;
        assert_eq!(report.delivered(), 1);
        assert_eq!(b.cache.get("orders", &orders_42()), Some("v2".to_string()));

        let stats = b.manager.stats();
        assert_eq!(stats.events_received, 2);
        assert_eq!(stats.duplicates_suppressed, 1);

        a.manager.shutdown().await.unwrap();
        b.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_local_member_never_targeted() {
        let a = start_node(test_config("node-a")).await;

        assert_eq!(a.manager.advertised_address(), Some(a.address.clone()));
        assert!(!a.manager.add_member(&a.address));

        a.manager.reconfigure(&[a.address.clone(), "127.0.0.1:1".to_string()]);
        let members = a.manager.members();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].address, "127.0.0.1:1");

        a.manager.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_silent_member_bounded_by_deadline() {
        // accepts connections but never answers
        let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let silent_address = silent.local_addr().unwrap().to_string();
        let _acceptor = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = silent.accept().await {
                held.push(stream);
            }
        });

        let b = start_node(test_config("node-b")).await;
        let a = start_node(ClusterConfig {
            send_timeout_ms: 10_000,
            broadcast_deadline_ms: 200,
            shutdown_grace_ms: 100,
            ..test_config("node-a")
        })
        .await;
        a.manager.add_member(&silent_address);
        a.manager.add_member(&b.address);
        b.cache.put("orders", 42, "pending".to_string());

        let started = Instant::now();
        let report = a
            .manager
            .notify_commit(vec![TableChange::new("orders").update(42)], 3)
            .await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(report.abandoned, vec![silent_address]);
        assert_eq!(report.outcome(&b.address), Some(&SendOutcome::Delivered));
        assert!(!b.cache.contains("orders", &orders_42()));

        a.manager.shutdown().await.unwrap();
        b.manager.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failing_member_enters_backoff() {
        let a = start_node(ClusterConfig {
            failure_threshold: 1,
            backoff_base_ms: 60_000,
            max_retries: 0,
            ..test_config("node-a")
        })
        .await;
        let down = unused_address();
        a.manager.add_member(&down);

        let first = a
            .manager
            .notify_commit(vec![TableChange::bulk("orders")], 1)
            .await;
        assert!(matches!(first.outcome(&down), Some(SendOutcome::Failed(_))));

        let second = a
            .manager
            .notify_commit(vec![TableChange::bulk("orders")], 2)
            .await;
        assert_eq!(second.skipped, vec![down.clone()]);
        assert!(second.outcomes.is_empty());

        let stats = a.manager.stats();
        assert_eq!(stats.send_failures, 1);
        assert!(stats.members[0].suspended);

        a.manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_startup_fails_when_address_taken() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ClusterConfig {
            bind_address: taken.local_addr().unwrap().to_string(),
            ..test_config("node-a")
        };
        let manager = ClusterManager::new(config, Arc::new(MemoryCache::<String>::new())).unwrap();

        let err = manager.startup().await.unwrap_err();
        assert!(matches!(err, ClusterError::Startup { .. }));
        assert_eq!(manager.state(), ManagerState::Created);
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let a = start_node(test_config("node-a")).await;
        assert_eq!(a.manager.state(), ManagerState::Running);

        let err = a.manager.startup().await.unwrap_err();
        assert!(matches!(err, ClusterError::InvalidState(ManagerState::Running)));

        a.manager.shutdown().await.unwrap();
        a.manager.shutdown().await.unwrap();
        assert_eq!(a.manager.state(), ManagerState::Stopped);

        let err = a.manager.startup().await.unwrap_err();
        assert!(matches!(err, ClusterError::InvalidState(ManagerState::Stopped)));
    }

    #[tokio::test]
    async fn test_event_after_shutdown_ignored() {
        let a = start_node(test_config("node-a")).await;
        // held by the listener for the manager's lifetime
        let dispatcher = a.manager.dispatcher();
        a.cache.put("orders", 42, "pending".to_string());

        a.manager.shutdown().await.unwrap();

        let late = TransactionEvent::new("node-b", 4, vec![TableChange::new("orders").delete(42)]);
        dispatcher.handle_frame(Frame::Event(late), "127.0.0.1:9".parse().unwrap());

        assert!(a.cache.contains("orders", &orders_42()));
        assert_eq!(a.manager.stats().events_received, 0);
    }

    #[test]
    fn test_own_origin_event_ignored() {
        let cache = Arc::new(MemoryCache::<String>::new());
        let manager = ClusterManager::new(test_config("node-a"), cache.clone()).unwrap();
        let dispatcher = manager.dispatcher();
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        cache.put("orders", 42, "pending".to_string());

        let own = TransactionEvent::new("node-a", 5, vec![TableChange::new("orders").update(42)]);
        dispatcher.handle_frame(Frame::Event(own), peer);

        assert!(cache.contains("orders", &orders_42()));
        assert_eq!(manager.stats().events_received, 0);

        let remote = TransactionEvent::new("node-b", 5, vec![TableChange::new("orders").update(42)]);
        dispatcher.handle_frame(Frame::Event(remote), peer);

        assert!(!cache.contains("orders", &orders_42()));
        assert_eq!(manager.stats().events_received, 1);
    }

    #[tokio::test]
    async fn test_broadcast_skipped_unless_running() {
        let manager = ClusterManager::new(
            test_config("node-a"),
            Arc::new(MemoryCache::<String>::new()),
        )
        .unwrap();
        manager.add_member("127.0.0.1:1");

        let report = manager
            .notify_commit(vec![TableChange::new("orders").update(42)], 1)
            .await;

        assert!(report.is_empty());
        assert_eq!(manager.stats().broadcasts_skipped, 1);
        assert_eq!(manager.stats().events_broadcast, 0);
    }

    #[tokio::test]
    async fn test_empty_commit_not_broadcast() {
        let a = start_node(test_config("node-a")).await;
        a.manager.add_member("127.0.0.1:1");

        let report = a
            .manager
            .notify_commit(vec![TableChange::new("orders")], 9)
            .await;

        assert!(report.is_empty());
        assert_eq!(a.manager.stats().events_broadcast, 0);
        a.manager.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_join_and_leave_notices() {
        let b = start_node(test_config("node-b")).await;
        let a = start_node(ClusterConfig {
            members: vec![b.address.clone()],
            ..test_config("node-a")
        })
        .await;

        // the join notice registers A with B
        let members = b.manager.members();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].address, a.address);

        a.manager.shutdown().await.unwrap();

        let members = b.manager.members();
        assert_eq!(members[0].state, MemberState::Unreachable);
        assert!(members[0].consecutive_failures >= b.manager.config().failure_threshold);

        b.manager.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_datagram_transport_end_to_end() {
        let a = start_node(datagram_config("node-a")).await;
        let b = start_node(datagram_config("node-b")).await;
        connect(&[&a, &b]);
        b.cache.put("orders", 42, "pending".to_string());
        b.cache.put("customers", 1, "alice".to_string());

        let report = a
            .manager
            .notify_commit(
                vec![
                    TableChange::new("orders").insert(42),
                    TableChange::bulk("customers"),
                ],
                11,
            )
            .await;
        assert_eq!(report.delivered(), 1);

        wait_until(|| b.cache.is_empty()).await;
        assert_eq!(b.manager.stats().events_received, 1);

        a.manager.shutdown().await.unwrap();
        b.manager.shutdown().await.unwrap();
    }

    fn datagram_config(server_id: &str) -> ClusterConfig {
        ClusterConfig {
            transport: TransportKind::Datagram,
            ..test_config(server_id)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_datagram_killed_member_marked_unreachable() {
        let a = start_node(datagram_config("node-a")).await;
        let b = start_node(datagram_config("node-b")).await;
        let c = start_node(datagram_config("node-c")).await;
        connect(&[&a, &b, &c]);
        c.cache.put("orders", 42, "pending".to_string());

        // crash: the socket goes away without a leave notice
        b.manager.transport.close().await;

        let report = a
            .manager
            .notify_commit(vec![TableChange::new("orders").delete(42)], 2)
            .await;

        assert!(matches!(report.outcome(&b.address), Some(SendOutcome::Failed(_))));
        assert_eq!(report.outcome(&c.address), Some(&SendOutcome::Delivered));
        assert!(!c.cache.contains("orders", &orders_42()));

        let members = a.manager.members();
        let member_b = members.iter().find(|m| m.address == b.address).unwrap();
        assert_eq!(member_b.state, MemberState::Unreachable);
        assert_eq!(member_b.consecutive_failures, 1);
        assert_eq!(a.manager.stats().send_failures, 1);

        a.manager.shutdown().await.unwrap();
        c.manager.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_oversized_datagram_event_invalidates_table() {
        let a = start_node(ClusterConfig {
            failure_threshold: 1,
            backoff_base_ms: 60_000,
            ..datagram_config("node-a")
        })
        .await;
        let b = start_node(datagram_config("node-b")).await;
        connect(&[&a, &b]);
        b.cache.put("orders", 42, "pending".to_string());
        b.cache.put("orders", 99_999, "shipped".to_string());
        b.cache.put("customers", 1, "alice".to_string());

        let wide = (0..20_000).fold(TableChange::new("orders"), |change, key| change.update(key));
        let report = a.manager.notify_commit(vec![wide], 1).await;

        assert_eq!(report.outcome(&b.address), Some(&SendOutcome::Delivered));
        // the whole table goes, including keys outside the change
        assert!(!b.cache.contains("orders", &orders_42()));
        assert!(!b.cache.contains("orders", &PkValue::from(99_999)));
        assert!(b.cache.contains("customers", &PkValue::from(1)));

        let members = a.manager.members();
        assert_eq!(members[0].state, MemberState::Reachable);
        assert_eq!(members[0].consecutive_failures, 0);

        b.cache.put("orders", 42, "paid".to_string());
        let next = a
            .manager
            .notify_commit(vec![TableChange::new("orders").update(42)], 2)
            .await;
        assert!(next.skipped.is_empty());
        assert_eq!(next.delivered(), 1);
        assert!(!b.cache.contains("orders", &orders_42()));
        assert_eq!(a.manager.stats().send_failures, 0);

        a.manager.shutdown().await.unwrap();
        b.manager.shutdown().await.unwrap();
    }
}
