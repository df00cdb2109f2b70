//! Cohort Cluster - transaction broadcast for cache coherence
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Cohort Cluster                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌───────────────┐  ┌───────────────┐  ┌───────────────┐    │
//! │  │ClusterManager │  │MemberRegistry │  │ EventApplier  │    │
//! │  │               │  │               │  │               │    │
//! │  │ - Lifecycle   │  │ - Static list │  │ - Dedup       │    │
//! │  │ - Commit hook │  │ - Reachability│  │ - Evict keys  │    │
//! │  │ - Stats       │  │ - Backoff     │  │ - Evict table │    │
//! │  └───────┬───────┘  └───────┬───────┘  └───────▲───────┘    │
//! │          │                  │                  │            │
//! │  ┌───────┴──────────────────┴───────┐          │            │
//! │  │           Broadcaster            │          │            │
//! │  │  parallel sends, deadline bound  │          │            │
//! │  └────────────────┬─────────────────┘          │            │
//! │                   │                            │            │
//! │  ┌────────────────┴────────────────────────────┴──────┐     │
//! │  │              BroadcastTransport                    │     │
//! │  │              (TCP / datagram)                      │     │
//! │  └────────────────────────────────────────────────────┘     │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Evict-only events**: applying an event in any order or any number of
//!   times leaves the cache in the same state
//! - **Bounded commit latency**: a broadcast holds the caller for at most the
//!   configured deadline
//! - **Failure isolation**: one unreachable member never delays delivery to
//!   the others
//! - **Backoff**: repeatedly failing members are probed once per window
//! - **Duplicate suppression**: per `(origin, transaction)` delivery history

mod applier;
mod broadcaster;
mod codec;
mod error;
mod manager;
mod metrics;
mod registry;
mod transport;

pub use applier::{ApplyOutcome, DeliveryHistory, DeliveryKey, EventApplier, TableFailure};
pub use broadcaster::{BroadcastReport, Broadcaster, SendOutcome};
pub use codec::{decode_frame, encode_frame, stream_codec, Frame, MemberNotice};
pub use error::{ClusterError, ClusterResult};
pub use manager::{ClusterManager, ClusterManagerBuilder};
pub use crate::metrics::{names as metric_names, ClusterMetrics, MetricsSnapshot};
pub use registry::{ClusterMember, Eligibility, MemberRegistry};
pub use transport::{
    BroadcastTransport, DatagramTransport, DatagramTransportConfig, FrameHandler, TcpTransport,
    TcpTransportConfig,
};

// Re-export types from core
pub use cohort_core::types::{
    BackoffPolicy, ClusterConfig, ClusterStats, ManagerState, MemberState, MemberStatus, PkValue,
    ServerId, TableChange, TransactionEvent, TransportKind,
};
pub use cohort_core::{CacheInvalidator, MemoryCache};
