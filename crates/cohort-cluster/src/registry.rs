//! Member registry
//!
//! Tracks the known peers and their reachability:
//! - Static members from configuration
//! - Members announcing themselves with a join notice
//! - Send outcomes reported by the broadcaster
//! - Backoff for members that keep failing
//!
//! Readers always get a cloned point-in-time snapshot; every update is one
//! short write-locked step, so callers never lock anything themselves.

use std::collections::BTreeMap;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use cohort_core::types::{BackoffPolicy, MemberState, MemberStatus};

/// A known peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMember {
    /// `host:port` the transport sends to
    pub address: String,
    pub state: MemberState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<Instant>,
    pub last_success_at: Option<Instant>,
    /// A backoff probe has been handed out and its outcome is pending
    probe_in_flight: bool,
}

impl ClusterMember {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            state: MemberState::Unknown,
            consecutive_failures: 0,
            last_failure_at: None,
            last_success_at: None,
            probe_in_flight: false,
        }
    }

    /// True while backoff keeps this member out of broadcasts
    pub fn is_suspended(&self, policy: &BackoffPolicy, now: Instant) -> bool {
        if self.consecutive_failures < policy.failure_threshold {
            return false;
        }
        if self.probe_in_flight {
            return true;
        }
        match self.last_failure_at {
            Some(at) => now.saturating_duration_since(at) < policy.window(self.consecutive_failures),
            None => false,
        }
    }

    pub fn status(&self, policy: &BackoffPolicy, now: Instant) -> MemberStatus {
        MemberStatus {
            address: self.address.clone(),
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            suspended: self.is_suspended(policy, now),
        }
    }
}

/// Send targets chosen for one broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Eligibility {
    /// Members to send to, including any probe claimed by this call
    pub targets: Vec<String>,
    /// Members skipped by backoff
    pub skipped: Vec<String>,
}

/// Registry of cluster members
#[derive(Debug)]
pub struct MemberRegistry {
    /// Address under which this instance is known; never a send target
    local_address: RwLock<Option<String>>,
    policy: BackoffPolicy,
    members: RwLock<BTreeMap<String, ClusterMember>>,
}

impl MemberRegistry {
    /// Create a registry from a static member list. The local address, if
    /// present in the list, is left out.
    pub fn new(
        members: impl IntoIterator<Item = String>,
        local_address: Option<String>,
        policy: BackoffPolicy,
    ) -> Self {
        let registry = Self {
            local_address: RwLock::new(local_address),
            policy,
            members: RwLock::new(BTreeMap::new()),
        };
        for address in members {
            registry.add_member(&address);
        }
        registry
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn local_address(&self) -> Option<String> {
        self.local_address.read().clone()
    }

    /// Record the address this instance advertises and drop it from the peer set
    pub fn set_local_address(&self, address: impl Into<String>) {
        let address = address.into();
        if self.members.write().remove(&address).is_some() {
            debug!("Removed local address {} from member list", address);
        }
        *self.local_address.write() = Some(address);
    }

    fn is_local(&self, address: &str) -> bool {
        self.local_address.read().as_deref() == Some(address)
    }

    /// Register a member. Returns false if it is local or already known.
    pub fn add_member(&self, address: &str) -> bool {
        let address = address.trim();
        if address.is_empty() || self.is_local(address) {
            return false;
        }

        let mut members = self.members.write();
        if members.contains_key(address) {
            return false;
        }
        members.insert(address.to_string(), ClusterMember::new(address));
        true
    }

    /// Replace the member set. Known members keep their state; members not
    /// listed are removed.
    pub fn reconfigure(&self, addresses: &[String]) {
        let local = self.local_address();
        let mut members = self.members.write();

        members.retain(|address, _| addresses.iter().any(|a| a.trim() == address));
        for address in addresses {
            let address = address.trim();
            if address.is_empty() || local.as_deref() == Some(address) {
                continue;
            }
            members
                .entry(address.to_string())
                .or_insert_with(|| ClusterMember::new(address));
        }

        info!("Member list reconfigured: {} members", members.len());
    }

    /// Point-in-time snapshot of all members
    pub fn members(&self) -> Vec<ClusterMember> {
        self.members.read().values().cloned().collect()
    }

    pub fn get(&self, address: &str) -> Option<ClusterMember> {
        self.members.read().get(address).cloned()
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    pub fn statuses(&self) -> Vec<MemberStatus> {
        let now = Instant::now();
        self.members
            .read()
            .values()
            .map(|m| m.status(&self.policy, now))
            .collect()
    }

    /// Choose send targets for a broadcast happening now
    pub fn eligible(&self) -> Eligibility {
        self.eligible_at(Instant::now())
    }

    /// Choose send targets at `now`. A suspended member whose window has
    /// elapsed is handed out as a probe exactly once; it stays skipped until
    /// that probe's outcome is recorded.
    pub fn eligible_at(&self, now: Instant) -> Eligibility {
        let mut members = self.members.write();
        let mut eligibility = Eligibility::default();

        for member in members.values_mut() {
            if member.consecutive_failures < self.policy.failure_threshold {
                eligibility.targets.push(member.address.clone());
            } else if member.is_suspended(&self.policy, now) {
                eligibility.skipped.push(member.address.clone());
            } else {
                debug!(
                    "Probing {} after {} consecutive failures",
                    member.address, member.consecutive_failures
                );
                member.probe_in_flight = true;
                eligibility.targets.push(member.address.clone());
            }
        }

        eligibility
    }

    /// Record a successful send
    pub fn mark_success(&self, address: &str) {
        self.mark_success_at(address, Instant::now());
    }

    pub fn mark_success_at(&self, address: &str, now: Instant) {
        let mut members = self.members.write();
        let Some(member) = members.get_mut(address) else {
            return;
        };

        if member.state == MemberState::Unreachable {
            info!(
                "Member {} is reachable again after {} failures",
                address, member.consecutive_failures
            );
        }
        member.state = MemberState::Reachable;
        member.consecutive_failures = 0;
        member.last_success_at = Some(now);
        member.probe_in_flight = false;
    }

    /// Hand back a probe slot after a send that never reached the member.
    /// Failure count and state stay as they were.
    pub fn release_probe(&self, address: &str) {
        if let Some(member) = self.members.write().get_mut(address) {
            member.probe_in_flight = false;
        }
    }

    /// Record a failed or timed out send
    pub fn mark_failure(&self, address: &str) {
        self.mark_failure_at(address, Instant::now());
    }

    pub fn mark_failure_at(&self, address: &str, now: Instant) {
        let mut members = self.members.write();
        let Some(member) = members.get_mut(address) else {
            return;
        };

        if member.state != MemberState::Unreachable {
            warn!("Member {} became unreachable", address);
        }
        member.state = MemberState::Unreachable;
        member.consecutive_failures = member.consecutive_failures.saturating_add(1);
        member.last_failure_at = Some(now);
        member.probe_in_flight = false;

        if member.consecutive_failures == self.policy.failure_threshold {
            warn!(
                "Member {} suspended for {:?} after {} consecutive failures",
                address,
                self.policy.window(member.consecutive_failures),
                member.consecutive_failures
            );
        }
    }

    /// A member announced itself. Clears any backoff; registers the member
    /// when unknown and `register` is set. Returns true if the member is known
    /// afterwards.
    pub fn mark_online(&self, address: &str, register: bool) -> bool {
        if self.is_local(address) {
            return false;
        }

        let mut members = self.members.write();
        match members.get_mut(address) {
            Some(member) => {
                member.consecutive_failures = 0;
                member.last_failure_at = None;
                member.probe_in_flight = false;
                if member.state == MemberState::Unreachable {
                    member.state = MemberState::Unknown;
                }
                true
            }
            None if register => {
                info!("Member {} joined the cluster", address);
                members.insert(address.to_string(), ClusterMember::new(address));
                true
            }
            None => false,
        }
    }

    /// A member announced it is leaving. It stays registered but is only
    /// probed again after a backoff window.
    pub fn mark_departed(&self, address: &str) {
        self.mark_departed_at(address, Instant::now());
    }

    pub fn mark_departed_at(&self, address: &str, now: Instant) {
        let mut members = self.members.write();
        let Some(member) = members.get_mut(address) else {
            return;
        };

        info!("Member {} left the cluster", address);
        member.state = MemberState::Unreachable;
        member.consecutive_failures = member
            .consecutive_failures
            .max(self.policy.failure_threshold);
        member.last_failure_at = Some(now);
        member.probe_in_flight = false;
    }
}
