//! TCP transport for member-to-member communication
//!
//! Handles direct connections between cluster members with:
//! - Length-prefixed frames
//! - One pooled connection per peer
//! - An acknowledgement for every frame
//! - Resend with exponential backoff on a broken connection

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use cohort_core::types::{ClusterConfig, TransportKind};

use super::{startup_error, BroadcastTransport, FrameHandler};
use crate::codec::{decode_frame, encode_frame, stream_codec, Frame};
use crate::error::{ClusterError, ClusterResult};

/// Upper bound on waiting for listener and connection tasks in `close`
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type Connection = Framed<TcpStream, LengthDelimitedCodec>;
type ConnectionSlot = Arc<tokio::sync::Mutex<Option<Connection>>>;

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Listener address
    pub bind_address: String,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Resend attempts after a broken connection
    pub max_retries: u32,
    /// Base delay for exponential backoff between resends
    pub retry_base_delay: Duration,
    /// Largest frame accepted or sent
    pub max_frame_bytes: usize,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            bind_address: format!("0.0.0.0:{}", cohort_core::DEFAULT_CLUSTER_PORT),
            connect_timeout: Duration::from_secs(1),
            max_retries: 1,
            retry_base_delay: Duration::from_millis(50),
            max_frame_bytes: cohort_core::DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl From<&ClusterConfig> for TcpTransportConfig {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            bind_address: config.bind_address.clone(),
            connect_timeout: config.connect_timeout(),
            max_retries: config.max_retries,
            retry_base_delay: config.retry_base_delay(),
            max_frame_bytes: config.max_frame_bytes,
        }
    }
}

/// Direct-connection transport
pub struct TcpTransport {
    config: TcpTransportConfig,
    connections: Mutex<HashMap<String, ConnectionSlot>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Self {
        Self {
            config,
            connections: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// The pooled connection slot for `address`. Only sends to the same
    /// peer contend on it.
    fn slot(&self, address: &str) -> ConnectionSlot {
        let mut connections = self.connections.lock();
        Arc::clone(connections.entry(address.to_string()).or_default())
    }

    async fn connect(&self, address: &str) -> ClusterResult<Connection> {
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| ClusterError::Transport(format!("connect to {} timed out", address)))??;
        stream.set_nodelay(true)?;

        debug!("Opened cluster connection to {}", address);
        Ok(Framed::new(stream, stream_codec(self.config.max_frame_bytes)))
    }

    /// Write one frame and wait for the peer's verdict
    async fn exchange(connection: &mut Connection, address: &str, frame: Bytes) -> ClusterResult<()> {
        connection.send(frame).await?;

        match connection.next().await {
            None => Err(ClusterError::ConnectionClosed(address.to_string())),
            Some(Err(e)) => Err(e.into()),
            Some(Ok(reply)) => match decode_frame(&reply)? {
                Frame::Ack => Ok(()),
                Frame::Nack(reason) => Err(ClusterError::Rejected {
                    member: address.to_string(),
                    reason,
                }),
                other => Err(ClusterError::MalformedFrame(format!(
                    "expected ack from {}, got {}",
                    address,
                    other.name()
                ))),
            },
        }
    }
}

#[async_trait]
impl BroadcastTransport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn max_frame_bytes(&self) -> usize {
        self.config.max_frame_bytes
    }

    async fn listen(&self, handler: Arc<dyn FrameHandler>) -> ClusterResult<SocketAddr> {
        let listener = TcpListener::bind(&self.config.bind_address)
            .await
            .map_err(|e| startup_error(&self.config.bind_address, e))?;
        let local_addr = listener.local_addr()?;
        info!("Cluster listener bound on {}", local_addr);

        let shutdown = self.shutdown.clone();
        let tasks = self.tasks.clone();
        let max_frame_bytes = self.config.max_frame_bytes;

        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!("Accepted cluster connection from {}", peer);
                            tasks.spawn(serve_connection(
                                stream,
                                peer,
                                Arc::clone(&handler),
                                shutdown.clone(),
                                max_frame_bytes,
                            ));
                        }
                        Err(e) => {
                            warn!("Failed to accept cluster connection: {}", e);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
            }

            debug!("Cluster listener on {} stopped", local_addr);
        });

        Ok(local_addr)
    }

    async fn send(&self, address: &str, frame: Bytes) -> ClusterResult<()> {
        if frame.len() > self.config.max_frame_bytes {
            return Err(ClusterError::FrameTooLarge {
                size: frame.len(),
                limit: self.config.max_frame_bytes,
            });
        }

        let slot = self.slot(address);
        let mut pooled = slot.lock().await;
        let mut last_error = None;
        let mut delay = self.config.retry_base_delay;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                debug!("Retry attempt {} for {}", attempt, address);
                tokio::time::sleep(delay).await;
                delay *= 2;
            }

            // The connection only goes back into the pool after a clean
            // exchange; a cancelled or failed send drops it.
            let mut connection = match pooled.take() {
                Some(connection) => connection,
                None => match self.connect(address).await {
                    Ok(connection) => connection,
                    Err(e) => {
                        debug!("Connect to {} failed (attempt {}): {}", address, attempt + 1, e);
                        last_error = Some(e);
                        continue;
                    }
                },
            };

            match Self::exchange(&mut connection, address, frame.clone()).await {
                Ok(()) => {
                    *pooled = Some(connection);
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    debug!("Send to {} failed (attempt {}): {}", address, attempt + 1, e);
                    last_error = Some(e);
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
        self.connections.lock().clear();
        self.tasks.close();

        if tokio::time::timeout(CLOSE_TIMEOUT, self.tasks.wait()).await.is_err() {
            warn!("Cluster connections did not stop within {:?}", CLOSE_TIMEOUT);
        }
    }
}

/// Read frames from one inbound connection until it closes or the
/// transport shuts down. Undecodable frames are answered with a nack and
/// skipped; a broken length prefix ends only this connection.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn FrameHandler>,
    shutdown: CancellationToken,
    max_frame_bytes: usize,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
    }
    let mut framed = Framed::new(stream, stream_codec(max_frame_bytes));

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = framed.next() => next,
        };

        let data = match next {
            None => break,
            Some(Ok(data)) => data,
            Some(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                handler.handle_malformed(peer, &ClusterError::MalformedFrame(e.to_string()));
                break;
            }
            Some(Err(e)) => {
                debug!("Cluster connection from {} failed: {}", peer, e);
                break;
            }
        };

        let reply = match decode_frame(&data) {
            Ok(Frame::Ack) | Ok(Frame::Nack(_)) => {
                debug!("Ignoring unsolicited reply from {}", peer);
                continue;
            }
            Ok(frame) => {
                handler.handle_frame(frame, peer);
                Frame::Ack
            }
            Err(e) => {
                handler.handle_malformed(peer, &e);
                Frame::Nack(e.to_string())
            }
        };

        let encoded = match encode_frame(&reply) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Failed to encode reply for {}: {}", peer, e);
                break;
            }
        };
        if let Err(e) = framed.send(encoded).await {
            debug!("Failed to reply to {}: {}", peer, e);
            break;
        }
    }

    debug!("Cluster connection from {} closed", peer);
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("config", &self.config)
            .field("pooled", &self.connections.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_core::types::{TableChange, TransactionEvent};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<Frame>>,
        malformed: AtomicUsize,
    }

    impl FrameHandler for Recorder {
        fn handle_frame(&self, frame: Frame, _peer: SocketAddr) {
            self.frames.lock().push(frame);
        }

        fn handle_malformed(&self, _peer: SocketAddr, _error: &ClusterError) {
            self.malformed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn local_config() -> TcpTransportConfig {
        TcpTransportConfig {
            bind_address: "127.0.0.1:0".to_string(),
            ..Default::default()
        }
    }

    fn event_frame(txn: u64) -> Frame {
        Frame::Event(TransactionEvent::new(
            "node-a",
            txn,
            vec![TableChange::new("orders").delete(42)],
        ))
    }

    #[test]
    fn test_transport_config_default() {
        let config = TcpTransportConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.bind_address, "0.0.0.0:9301");
    }

    #[tokio::test]
    async fn test_send_is_acknowledged() {
        let receiver = TcpTransport::new(local_config());
        let recorder = Arc::new(Recorder::default());
        let addr = receiver.listen(recorder.clone()).await.unwrap();

        let sender = TcpTransport::new(local_config());
        for txn in 1..=3 {
            let frame = encode_frame(&event_frame(txn)).unwrap();
            sender.send(&addr.to_string(), frame).await.unwrap();
        }

        assert_eq!(recorder.frames.lock().len(), 3);
        match &recorder.frames.lock()[2] {
            Frame::Event(event) => assert_eq!(event.transaction_id(), 3),
            other => panic!("unexpected frame {:?}", other),
        }
        // one pooled connection reused for all three frames
        assert_eq!(sender.connections.lock().len(), 1);

        sender.close().await;
        receiver.close().await;
    }

    #[tokio::test]
    async fn test_send_to_closed_port_fails() {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let sender = TcpTransport::new(local_config());
        let frame = encode_frame(&event_frame(1)).unwrap();
        assert!(sender.send(&addr.to_string(), frame).await.is_err());
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_stop_connection() {
        let receiver = TcpTransport::new(local_config());
        let recorder = Arc::new(Recorder::default());
        let addr = receiver.listen(recorder.clone()).await.unwrap();

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = Framed::new(stream, stream_codec(1024 * 1024));

        client.send(Bytes::from_static(&[1, 99])).await.unwrap();
        let reply = client.next().await.unwrap().unwrap();
        assert!(matches!(decode_frame(&reply).unwrap(), Frame::Nack(_)));

        client.send(encode_frame(&event_frame(5)).unwrap()).await.unwrap();
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(decode_frame(&reply).unwrap(), Frame::Ack);

        assert_eq!(recorder.malformed.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.frames.lock().len(), 1);

        receiver.close().await;
    }

    #[tokio::test]
    async fn test_broken_length_prefix_closes_only_that_connection() {
        let config = TcpTransportConfig {
            max_frame_bytes: 64,
            ..local_config()
        };
        let receiver = TcpTransport::new(config);
        let recorder = Arc::new(Recorder::default());
        let addr = receiver.listen(recorder.clone()).await.unwrap();

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut oversized = Framed::new(stream, stream_codec(1024 * 1024));
        oversized.send(Bytes::from(vec![0u8; 256])).await.unwrap();
        assert!(oversized.next().await.map_or(true, |r| r.is_err()));

        let sender = TcpTransport::new(local_config());
        let frame = encode_frame(&Frame::Hello(crate::codec::MemberNotice {
            server_id: "node-b".into(),
            address: "127.0.0.1:1".into(),
        }))
        .unwrap();
        sender.send(&addr.to_string(), frame).await.unwrap();

        assert_eq!(recorder.malformed.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.frames.lock().len(), 1);

        receiver.close().await;
    }

    #[tokio::test]
    async fn test_bind_conflict_is_startup_error() {
        let first = TcpTransport::new(local_config());
        let addr = first.listen(Arc::new(Recorder::default())).await.unwrap();

        let second = TcpTransport::new(TcpTransportConfig {
            bind_address: addr.to_string(),
            ..Default::default()
        });
        let err = second.listen(Arc::new(Recorder::default())).await.unwrap_err();
        assert!(matches!(err, ClusterError::Startup { .. }));

        first.close().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_peer_restart() {
        let first = TcpTransport::new(local_config());
        let recorder = Arc::new(Recorder::default());
        let addr = first.listen(recorder.clone()).await.unwrap();

        let sender = TcpTransport::new(local_config());
        sender
            .send(&addr.to_string(), encode_frame(&event_frame(1)).unwrap())
            .await
            .unwrap();
        first.close().await;

        let restarted = TcpTransport::new(TcpTransportConfig {
            bind_address: addr.to_string(),
            ..Default::default()
        });
        restarted.listen(recorder.clone()).await.unwrap();

        // the pooled connection is dead; the retry reconnects
        sender
            .send(&addr.to_string(), encode_frame(&event_frame(2)).unwrap())
            .await
            .unwrap();
        assert_eq!(recorder.frames.lock().len(), 2);

        restarted.close().await;
    }
}
