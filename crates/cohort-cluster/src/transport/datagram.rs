//! UDP datagram transport
//!
//! Every datagram is a big-endian `u32` sequence number followed by a frame
//! body, without the stream length prefix. The receiver answers an event or
//! notice with an `Ack` carrying the same sequence number and a malformed
//! body with a `Nack`. `send` waits for that reply and resends the same
//! datagram when it does not arrive in time.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use cohort_core::types::{ClusterConfig, TransportKind};

use super::{startup_error, BroadcastTransport, FrameHandler};
use crate::codec::{decode_frame, encode_frame, Frame};
use crate::error::{ClusterError, ClusterResult};

/// Largest UDP payload over IPv4
pub const MAX_DATAGRAM_BYTES: usize = 65_507;

/// Sequence number prepended to every datagram
pub const SEQUENCE_LEN: usize = 4;

/// Sends waiting for a reply, by peer and sequence number
type PendingReplies = Mutex<HashMap<(SocketAddr, u32), oneshot::Sender<Frame>>>;

#[derive(Debug, Clone)]
pub struct DatagramTransportConfig {
    pub bind_address: String,
    /// Largest datagram sent or received, sequence number included
    pub max_datagram_bytes: usize,
    /// Wait for the peer's reply before resending
    pub ack_timeout: Duration,
    /// Resends after a missing reply
    pub max_retries: u32,
    /// Base delay for exponential backoff between resends
    pub retry_base_delay: Duration,
}

impl Default for DatagramTransportConfig {
    fn default() -> Self {
        Self {
            bind_address: format!("0.0.0.0:{}", cohort_core::DEFAULT_CLUSTER_PORT),
            max_datagram_bytes: MAX_DATAGRAM_BYTES,
            ack_timeout: Duration::from_millis(500),
            max_retries: 1,
            retry_base_delay: Duration::from_millis(50),
        }
    }
}

impl From<&ClusterConfig> for DatagramTransportConfig {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            bind_address: config.bind_address.clone(),
            max_datagram_bytes: config.max_frame_bytes.min(MAX_DATAGRAM_BYTES),
            ack_timeout: config.ack_timeout(),
            max_retries: config.max_retries,
            retry_base_delay: config.retry_base_delay(),
        }
    }
}

pub struct DatagramTransport {
    config: DatagramTransportConfig,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    pending: Arc<PendingReplies>,
    next_sequence: AtomicU32,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl DatagramTransport {
    pub fn new(config: DatagramTransportConfig) -> Self {
        Self {
            config,
            socket: RwLock::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_sequence: AtomicU32::new(0),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }
}

/// Removes the pending entry when a send finishes or is cancelled
struct PendingGuard<'a> {
    pending: &'a PendingReplies,
    key: (SocketAddr, u32),
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.key);
    }
}

fn datagram(sequence: u32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(SEQUENCE_LEN + body.len());
    buf.put_u32(sequence);
    buf.extend_from_slice(body);
    buf.freeze()
}

async fn resolve(address: &str) -> ClusterResult<SocketAddr> {
    if let Ok(addr) = address.parse() {
        return Ok(addr);
    }
    tokio::net::lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| ClusterError::Transport(format!("{} did not resolve", address)))
}

async fn reply(socket: &UdpSocket, peer: SocketAddr, sequence: u32, frame: &Frame) {
    let body = match encode_frame(frame) {
        Ok(body) => body,
        Err(e) => {
            warn!("Failed to encode {} for {}: {}", frame.name(), peer, e);
            return;
        }
    };
    if let Err(e) = socket.send_to(&datagram(sequence, &body), peer).await {
        debug!("Failed to send {} #{} to {}: {}", frame.name(), sequence, peer, e);
    }
}

#[async_trait]
impl BroadcastTransport for DatagramTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    fn max_frame_bytes(&self) -> usize {
        self.config.max_datagram_bytes.saturating_sub(SEQUENCE_LEN)
    }

    async fn listen(&self, handler: Arc<dyn FrameHandler>) -> ClusterResult<SocketAddr> {
        let socket = UdpSocket::bind(&self.config.bind_address)
            .await
            .map_err(|e| startup_error(&self.config.bind_address, e))?;
        let local_addr = socket.local_addr()?;
        info!("Cluster datagram socket bound on {}", local_addr);

        let socket = Arc::new(socket);
        *self.socket.write() = Some(Arc::clone(&socket));

        let shutdown = self.shutdown.clone();
        let pending = Arc::clone(&self.pending);
        let mut buf = vec![0u8; self.config.max_datagram_bytes];

        self.tasks.spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = socket.recv_from(&mut buf) => received,
                };

                let (len, peer) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        // ICMP port unreachable from an earlier send surfaces here
                        debug!("Datagram receive failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        continue;
                    }
                };

                if len < SEQUENCE_LEN {
                    let error = ClusterError::MalformedFrame(format!(
                        "datagram of {} bytes has no sequence number",
                        len
                    ));
                    handler.handle_malformed(peer, &error);
                    continue;
                }

                let (mut head, body) = buf[..len].split_at(SEQUENCE_LEN);
                let sequence = head.get_u32();

                match decode_frame(body) {
                    Ok(answer @ (Frame::Ack | Frame::Nack(_))) => {
                        let waiter = pending.lock().remove(&(peer, sequence));
                        match waiter {
                            Some(waiter) => {
                                let _ = waiter.send(answer);
                            }
                            None => debug!(
                                "Ignoring {} #{} from {} with no send waiting",
                                answer.name(),
                                sequence,
                                peer
                            ),
                        }
                    }
                    Ok(frame) => {
                        handler.handle_frame(frame, peer);
                        reply(&socket, peer, sequence, &Frame::Ack).await;
                    }
                    Err(e) => {
                        handler.handle_malformed(peer, &e);
                        reply(&socket, peer, sequence, &Frame::Nack(e.to_string())).await;
                    }
                }
            }

            debug!("Cluster datagram socket on {} stopped", local_addr);
        });

        Ok(local_addr)
    }

    async fn send(&self, address: &str, frame: Bytes) -> ClusterResult<()> {
        if frame.len() > self.max_frame_bytes() {
            return Err(ClusterError::FrameTooLarge {
                size: frame.len(),
                limit: self.max_frame_bytes(),
            });
        }

        let socket = self
            .socket
            .read()
            .as_ref()
            .map(Arc::clone)
            .ok_or(ClusterError::NotListening)?;

        let peer = resolve(address).await?;
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let packet = datagram(sequence, &frame);

        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().insert((peer, sequence), tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            key: (peer, sequence),
        };

        let mut last_error = None;
        let mut delay = self.config.retry_base_delay;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                debug!("Resending datagram #{} to {} (attempt {})", sequence, address, attempt + 1);
                tokio::time::sleep(delay).await;
                delay *= 2;
            }

            if let Err(e) = socket.send_to(&packet, peer).await {
                debug!("Datagram to {} failed (attempt {}): {}", address, attempt + 1, e);
                last_error = Some(e.into());
                continue;
            }

            // a late reply to an earlier attempt still counts
            match tokio::time::timeout(self.config.ack_timeout, &mut rx).await {
                Ok(Ok(Frame::Ack)) => return Ok(()),
                Ok(Ok(Frame::Nack(reason))) => {
                    return Err(ClusterError::Rejected {
                        member: address.to_string(),
                        reason,
                    })
                }
                Ok(Ok(other)) => {
                    return Err(ClusterError::MalformedFrame(format!(
                        "expected ack from {}, got {}",
                        address,
                        other.name()
                    )))
                }
                Ok(Err(_)) => return Err(ClusterError::ConnectionClosed(address.to_string())),
                Err(_) => {
                    debug!(
                        "No ack for datagram #{} from {} within {:?}",
                        sequence, address, self.config.ack_timeout
                    );
                    last_error = Some(ClusterError::Transport(format!(
                        "no acknowledgement from {} within {:?}",
                        address, self.config.ack_timeout
                    )));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ClusterError::SendFailure {
            member: address.to_string(),
            reason: "no attempt made".to_string(),
        }))
    }

    async fn close(&self) {
        self.shutdown.cancel();
        self.socket.write().take();
        // waiting sends see their reply channel close
        self.pending.lock().clear();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

impl std::fmt::Debug for DatagramTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramTransport")
            .field("config", &self.config)
            .field("listening", &self.socket.read().is_some())
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}
