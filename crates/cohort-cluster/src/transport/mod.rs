//! Broadcast transports
//!
//! A [`BroadcastTransport`] moves encoded frames between members. The
//! cluster manager only depends on this trait; fan-out, timeouts and member
//! bookkeeping live in the [`Broadcaster`](crate::broadcaster::Broadcaster).
//!
//! Variants:
//! - [`TcpTransport`]: pooled connections, each frame acknowledged
//! - [`DatagramTransport`]: one UDP datagram per member, acknowledged by a
//!   reply datagram and resent when the ack does not arrive

mod datagram;
mod tcp;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use cohort_core::types::{ClusterConfig, TransportKind};

use crate::codec::Frame;
use crate::error::{ClusterError, ClusterResult};

pub use datagram::{DatagramTransport, DatagramTransportConfig};
pub use tcp::{TcpTransport, TcpTransportConfig};

/// Receives decoded inbound frames
pub trait FrameHandler: Send + Sync + 'static {
    /// Handle a well-formed frame from `peer`
    fn handle_frame(&self, frame: Frame, peer: SocketAddr);

    /// Inbound data from `peer` could not be decoded and was discarded
    fn handle_malformed(&self, peer: SocketAddr, error: &ClusterError);
}

/// Network mechanism connecting cluster members
#[async_trait]
pub trait BroadcastTransport: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> TransportKind;

    /// Largest encoded frame body `send` accepts
    fn max_frame_bytes(&self) -> usize;

    /// Bind the listening endpoint and start handing inbound frames to
    /// `handler`. Returns the bound address.
    async fn listen(&self, handler: Arc<dyn FrameHandler>) -> ClusterResult<SocketAddr>;

    /// Deliver one encoded frame body to the member at `address`
    async fn send(&self, address: &str, frame: Bytes) -> ClusterResult<()>;

    /// Stop listening and drop pooled connections
    async fn close(&self);
}

/// Build the transport variant named by the configuration
pub fn from_config(config: &ClusterConfig) -> Arc<dyn BroadcastTransport> {
    match config.transport {
        TransportKind::Tcp => Arc::new(TcpTransport::new(TcpTransportConfig::from(config))),
        TransportKind::Datagram => Arc::new(DatagramTransport::new(
            DatagramTransportConfig::from(config),
        )),
    }
}

/// Map a bind failure to the fatal startup error
pub(crate) fn startup_error(address: &str, source: std::io::Error) -> ClusterError {
    ClusterError::Startup {
        address: address.to_string(),
        source,
    }
}
