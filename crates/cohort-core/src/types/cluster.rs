//! Cluster types for Cohort members
//!
//! Configuration, member reachability and the statistics snapshot exposed to
//! the surrounding system.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ServerId;

/// Reachability of a cluster member as seen from this instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemberState {
    /// Registered, no send attempted yet
    #[default]
    Unknown,
    /// Last send succeeded
    Reachable,
    /// Last send failed
    Unreachable,
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberState::Unknown => write!(f, "unknown"),
            MemberState::Reachable => write!(f, "reachable"),
            MemberState::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Lifecycle state of the cluster manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ManagerState {
    #[default]
    Created,
    Running,
    Stopped,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerState::Created => write!(f, "created"),
            ManagerState::Running => write!(f, "running"),
            ManagerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Network mechanism used to reach peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Pooled TCP connections with per-frame acknowledgement
    #[default]
    Tcp,
    /// One UDP datagram per member, acknowledged by a reply datagram
    Datagram,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Datagram => write!(f, "datagram"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportKind::Tcp),
            "datagram" | "udp" => Ok(TransportKind::Datagram),
            other => Err(crate::Error::InvalidArgument(format!(
                "unknown transport '{}', expected tcp or datagram",
                other
            ))),
        }
    }
}

/// Backoff applied to members that keep failing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Consecutive failures before a member is suspended
    pub failure_threshold: u32,
    /// First suspension window
    pub base: Duration,
    /// Upper bound for the suspension window
    pub max: Duration,
}

impl BackoffPolicy {
    /// Suspension window for a member with `failures` consecutive failures.
    /// Zero while below the threshold; doubles per failure beyond it.
    pub fn window(&self, failures: u32) -> Duration {
        if failures < self.failure_threshold {
            return Duration::ZERO;
        }
        let exponent = (failures - self.failure_threshold).min(20);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

/// Cluster configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// This instance's identity, unique per running instance
    pub server_id: ServerId,
    /// Address the listener binds to
    pub bind_address: String,
    /// Address peers use to reach this instance (defaults to the bound address)
    pub advertise_address: Option<String>,
    /// Static member list (`host:port`); may include this instance
    pub members: Vec<String>,
    /// Transport variant
    pub transport: TransportKind,
    /// Per-member send timeout in milliseconds
    pub send_timeout_ms: u64,
    /// Overall time a broadcast may hold the caller, in milliseconds
    pub broadcast_deadline_ms: u64,
    /// Time shutdown waits for in-flight sends, in milliseconds
    pub shutdown_grace_ms: u64,
    /// Consecutive failures before backoff applies
    pub failure_threshold: u32,
    /// First backoff window in milliseconds
    pub backoff_base_ms: u64,
    /// Backoff window cap in milliseconds
    pub backoff_max_ms: u64,
    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Time a datagram send waits for the peer's ack, in milliseconds
    pub ack_timeout_ms: u64,
    /// Resend attempts on a broken connection or missing ack within one send
    pub max_retries: u32,
    /// Base delay between resend attempts in milliseconds
    pub retry_base_delay_ms: u64,
    /// Largest accepted frame in bytes
    pub max_frame_bytes: usize,
    /// Delivery records retained for duplicate detection
    pub dedup_capacity: usize,
    /// Age after which a delivery record is forgotten, in seconds
    pub dedup_horizon_secs: u64,
    /// Register unknown members announcing themselves with a join notice
    pub accept_joins: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            server_id: default_server_id(),
            bind_address: format!("0.0.0.0:{}", crate::DEFAULT_CLUSTER_PORT),
            advertise_address: None,
            members: Vec::new(),
            transport: TransportKind::Tcp,
            send_timeout_ms: 3_000,
            broadcast_deadline_ms: 500,
            shutdown_grace_ms: 1_000,
            failure_threshold: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            connect_timeout_ms: 1_000,
            ack_timeout_ms: 500,
            max_retries: 1,
            retry_base_delay_ms: 50,
            max_frame_bytes: crate::DEFAULT_MAX_FRAME_BYTES,
            dedup_capacity: 10_000,
            dedup_horizon_secs: 600,
            accept_joins: true,
        }
    }
}

impl ClusterConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn broadcast_deadline(&self) -> Duration {
        Duration::from_millis(self.broadcast_deadline_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn dedup_horizon(&self) -> Duration {
        Duration::from_secs(self.dedup_horizon_secs)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            failure_threshold: self.failure_threshold,
            base: Duration::from_millis(self.backoff_base_ms),
            max: Duration::from_millis(self.backoff_max_ms),
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.server_id.trim().is_empty() {
            return Err(crate::Error::InvalidConfig("server_id must not be empty".into()));
        }
        if self.bind_address.trim().is_empty() {
            return Err(crate::Error::InvalidConfig("bind_address must not be empty".into()));
        }
        if let Some(member) = self.members.iter().find(|m| m.trim().is_empty()) {
            return Err(crate::Error::InvalidConfig(format!(
                "member address must not be empty: {:?}",
                member
            )));
        }
        if self.failure_threshold == 0 {
            return Err(crate::Error::InvalidConfig(
                "failure_threshold must be at least 1".into(),
            ));
        }
        if self.broadcast_deadline_ms == 0 || self.send_timeout_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "send_timeout_ms and broadcast_deadline_ms must be positive".into(),
            ));
        }
        if self.ack_timeout_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "ack_timeout_ms must be positive".into(),
            ));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(crate::Error::InvalidConfig(format!(
                "backoff_max_ms ({}) is below backoff_base_ms ({})",
                self.backoff_max_ms, self.backoff_base_ms
            )));
        }
        if self.dedup_capacity == 0 {
            return Err(crate::Error::InvalidConfig(
                "dedup_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// `<hostname>-<8 hex chars>`, fresh for every process
pub fn default_server_id() -> ServerId {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "cohort-node".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

/// Reachability of one member, for observability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberStatus {
    pub address: String,
    pub state: MemberState,
    pub consecutive_failures: u32,
    /// Member is currently skipped by backoff
    pub suspended: bool,
}

/// Counters and member states exposed to the surrounding system
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStats {
    pub server_id: ServerId,
    pub state: ManagerState,
    /// Events handed to the transport
    pub events_broadcast: u64,
    /// Remote events received
    pub events_received: u64,
    /// Remote events ignored as duplicates
    pub duplicates_suppressed: u64,
    /// Per-member send attempts that failed or timed out
    pub send_failures: u64,
    /// Inbound frames discarded as malformed
    pub malformed_frames: u64,
    /// Table invalidations that failed
    pub apply_failures: u64,
    /// Broadcasts ignored because the manager was not running
    pub broadcasts_skipped: u64,
    pub members: Vec<MemberStatus>,
}

impl ClusterStats {
    pub fn reachable_members(&self) -> usize {
        self.members
            .iter()
            .filter(|m| m.state == MemberState::Reachable)
            .count()
    }
}
