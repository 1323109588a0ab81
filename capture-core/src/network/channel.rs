//! Command channel
//!
//! Line-delimited JSON over TCP. The device listens for the controller and
//! keeps exactly one active connection: a newer connection preempts the old
//! one. Outbound connects (controller side, or a device dialing a known
//! controller) retry with exponential backoff.
//!
//! The manager runs in a background task. Everyone else talks to it through
//! a cloneable [`ChannelHandle`] and receives [`ChannelEvent`]s.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::clock::SharedClock;
use crate::config::CoreConfig;
use crate::metrics::SharedMetrics;
use crate::network::backoff::RetryPolicy;
use crate::protocol::{DecodeError, EnhancedMessage, ErrorPayload, Payload};

/// Longest frame accepted from a peer
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Channel errors
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Failed to bind port {port} after {attempts} attempts: {source}")]
    Bind {
        port: u16,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Channel task closed")]
    Closed,
}

/// Events emitted by the channel manager
#[derive(Debug)]
pub enum ChannelEvent {
    /// Listener bound (device side)
    Listening { port: u16 },
    /// A peer connection became the active one
    Connected { peer: SocketAddr },
    /// The active connection went away
    Disconnected { peer: SocketAddr, preempted: bool },
    /// A frame decoded into a message. `received_at` is the local clock at receipt.
    Message {
        message: EnhancedMessage,
        received_at: i64,
    },
    /// A frame could not be decoded
    DecodeFailed(DecodeError),
    /// All outbound connect attempts failed
    ConnectFailed { addr: SocketAddr, attempts: u32 },
    /// Non-fatal error
    Error(String),
}

/// Commands sent to the channel manager
#[derive(Debug)]
pub enum ChannelCommand {
    /// Write a message to the active connection
    Send(EnhancedMessage),
    /// Dial a peer, retrying with backoff
    Connect(SocketAddr),
    /// Drop the active connection
    Disconnect,
    /// Stop the manager and every task it owns
    Shutdown,
}

/// Handle to the running channel
#[derive(Clone)]
pub struct ChannelHandle {
    command_tx: mpsc::UnboundedSender<ChannelCommand>,
    device_id: String,
    clock: SharedClock,
    connected: Arc<AtomicBool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ChannelHandle {
    /// A handle that is not attached to a manager. Whatever is sent shows up
    /// on the returned receiver.
    pub fn detached(
        device_id: impl Into<String>,
        clock: SharedClock,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelCommand>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (_, shutdown_rx) = watch::channel(false);
        let handle = Self {
            command_tx,
            device_id: device_id.into(),
            clock,
            connected: Arc::new(AtomicBool::new(true)),
            shutdown_rx,
        };
        (handle, command_rx)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Whether a peer connection is currently active
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Receiver that flips to `true` when the channel shuts down
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Wrap a payload into an envelope stamped with our id and clock
    pub fn message(&self, payload: Payload) -> EnhancedMessage {
        EnhancedMessage::new(payload, self.device_id.clone(), self.clock.now_ms())
    }

    pub fn send(&self, message: EnhancedMessage) -> Result<(), ChannelError> {
        self.command_tx
            .send(ChannelCommand::Send(message))
            .map_err(|_| ChannelError::Closed)
    }

    /// Send a new message, returning its id
    pub fn send_payload(
        &self,
        payload: Payload,
        session_id: Option<String>,
    ) -> Result<String, ChannelError> {
        let message = self.message(payload).with_session(session_id);
        let message_id = message.message_id.clone();
        self.send(message)?;
        Ok(message_id)
    }

    /// Reply to a request, reusing its message id and session
    pub fn respond(&self, request: &EnhancedMessage, payload: Payload) -> Result<(), ChannelError> {
        let message = self
            .message(payload)
            .with_message_id(request.message_id.clone())
            .with_session(request.session_id.clone())
            .requiring_ack(false);
        self.send(message)
    }

    /// Send an ERROR, correlated to the offending message when its id is known
    pub fn respond_error(
        &self,
        message_id: Option<&str>,
        error: ErrorPayload,
    ) -> Result<(), ChannelError> {
        let mut message = self.message(Payload::Error(error));
        if let Some(id) = message_id {
            message = message.with_message_id(id);
        }
        self.send(message)
    }

    pub fn connect(&self, addr: SocketAddr) -> Result<(), ChannelError> {
        self.command_tx
            .send(ChannelCommand::Connect(addr))
            .map_err(|_| ChannelError::Closed)
    }

    pub fn disconnect(&self) -> Result<(), ChannelError> {
        self.command_tx
            .send(ChannelCommand::Disconnect)
            .map_err(|_| ChannelError::Closed)
    }

    pub fn shutdown(&self) {
        let _ = self.command_tx.send(ChannelCommand::Shutdown);
    }
}

/// Messages from the per-connection tasks back to the manager
enum Internal {
    Frame { conn_id: u64, frame: Frame },
    Closed { conn_id: u64, reason: Option<String> },
    Dialed { stream: TcpStream, peer: SocketAddr },
    DialFailed { addr: SocketAddr, attempts: u32 },
}

struct ActiveConnection {
    id: u64,
    peer: SocketAddr,
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

/// Owns the listener and the active connection - runs in a background task
pub struct ChannelManager {
    config: CoreConfig,
    clock: SharedClock,
    metrics: SharedMetrics,
    policy: RetryPolicy,
    active: Option<ActiveConnection>,
    next_conn_id: u64,
    connected: Arc<AtomicBool>,
    dialer: Option<JoinHandle<()>>,
}

impl ChannelManager {
    pub fn new(config: CoreConfig, clock: SharedClock, metrics: SharedMetrics) -> Self {
        let policy = RetryPolicy::from_config(&config);
        Self {
            config,
            clock,
            metrics,
            policy,
            active: None,
            next_conn_id: 0,
            connected: Arc::new(AtomicBool::new(false)),
            dialer: None,
        }
    }

    /// Bind the command port and start accepting the controller
    pub async fn start(
        self,
    ) -> Result<(ChannelHandle, mpsc::UnboundedReceiver<ChannelEvent>), ChannelError> {
        let listener = bind_with_retry(self.config.server_port, &self.policy).await?;
        Ok(self.spawn(Some(listener)))
    }

    /// Start without a listener; connections are only made through
    /// [`ChannelHandle::connect`]
    pub fn start_client(self) -> (ChannelHandle, mpsc::UnboundedReceiver<ChannelEvent>) {
        self.spawn(None)
    }

    fn spawn(
        self,
        listener: Option<TcpListener>,
    ) -> (ChannelHandle, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = ChannelHandle {
            command_tx,
            device_id: self.config.device_id.clone(),
            clock: self.clock.clone(),
            connected: self.connected.clone(),
            shutdown_rx,
        };

        if let Some(listener) = &listener {
            if let Ok(addr) = listener.local_addr() {
                info!("Command channel listening on {}", addr);
                let _ = event_tx.send(ChannelEvent::Listening { port: addr.port() });
            }
        }

        tokio::spawn(async move {
            self.run(listener, event_tx, command_rx, shutdown_tx).await;
        });

        (handle, event_rx)
    }

    async fn run(
        mut self,
        listener: Option<TcpListener>,
        event_tx: mpsc::UnboundedSender<ChannelEvent>,
        mut command_rx: mpsc::UnboundedReceiver<ChannelCommand>,
        shutdown_tx: watch::Sender<bool>,
    ) {
        let (internal_tx, mut internal_rx) = mpsc::unbounded_channel();
        let io_timeout = self.config.io_timeout;
        let mut accept_failures = 0u32;

        loop {
            tokio::select! {
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(ChannelCommand::Send(message)) => {
                            self.write(message, &event_tx).await;
                        }
                        Some(ChannelCommand::Connect(addr)) => {
                            self.dial(addr, &internal_tx, shutdown_tx.subscribe());
                        }
                        Some(ChannelCommand::Disconnect) => {
                            self.close_active(&event_tx, false).await;
                        }
                        Some(ChannelCommand::Shutdown) | None => {
                            info!("Command channel shutting down");
                            break;
                        }
                    }
                }
                accepted = accept_next(listener.as_ref(), io_timeout) => {
                    match accepted {
                        Some(Ok((stream, peer))) => {
                            accept_failures = 0;
                            info!("Accepted controller connection from {}", peer);
                            self.adopt(stream, peer, &internal_tx, &shutdown_tx, &event_tx).await;
                        }
                        Some(Err(e)) => {
                            accept_failures += 1;
                            warn!("Accept failed ({}/{}): {}", accept_failures, self.policy.max_attempts, e);
                            if accept_failures >= self.policy.max_attempts {
                                let _ = event_tx.send(ChannelEvent::Error(format!(
                                    "Listener failed {} times, giving up: {}", accept_failures, e
                                )));
                                break;
                            }
                            tokio::time::sleep(self.policy.linear_delay(accept_failures)).await;
                        }
                        // Timed out, loop around
                        None => {}
                    }
                }
                Some(internal) = internal_rx.recv() => {
                    self.handle_internal(internal, &internal_tx, &shutdown_tx, &event_tx).await;
                }
            }
        }

        let _ = shutdown_tx.send(true);
        if let Some(dialer) = self.dialer.take() {
            dialer.abort();
        }
        self.close_active(&event_tx, false).await;
    }

    async fn handle_internal(
        &mut self,
        internal: Internal,
        internal_tx: &mpsc::UnboundedSender<Internal>,
        shutdown_tx: &watch::Sender<bool>,
        event_tx: &mpsc::UnboundedSender<ChannelEvent>,
    ) {
        match internal {
            Internal::Frame { conn_id, frame } => {
                if self.active.as_ref().map(|c| c.id) != Some(conn_id) {
                    trace!("Dropping frame from stale connection {}", conn_id);
                    return;
                }
                let received_at = self.clock.now_ms();
                self.metrics.update(|m| m.messages_received += 1);
                let decoded = match frame {
                    Frame::Line(bytes) => EnhancedMessage::decode_bytes(&bytes),
                    Frame::Oversized => Err(DecodeError::FrameTooLong { limit: MAX_FRAME_LEN }),
                };
                match decoded {
                    Ok(message) => {
                        trace!("Received {:?} ({})", message.message_type(), message.message_id);
                        let _ = event_tx.send(ChannelEvent::Message {
                            message,
                            received_at,
                        });
                    }
                    Err(e) => {
                        warn!("Failed to decode frame: {}", e);
                        self.metrics.update(|m| m.decode_errors += 1);
                        let _ = event_tx.send(ChannelEvent::DecodeFailed(e));
                    }
                }
            }
            Internal::Closed { conn_id, reason } => {
                if self.active.as_ref().map(|c| c.id) != Some(conn_id) {
                    return;
                }
                match reason {
                    Some(reason) => warn!("Connection closed: {}", reason),
                    None => info!("Peer closed the connection"),
                }
                self.close_active(event_tx, false).await;
            }
            Internal::Dialed { stream, peer } => {
                self.dialer = None;
                info!("Connected to {}", peer);
                self.adopt(stream, peer, internal_tx, shutdown_tx, event_tx).await;
            }
            Internal::DialFailed { addr, attempts } => {
                self.dialer = None;
                warn!("Giving up on {} after {} attempts", addr, attempts);
                let _ = event_tx.send(ChannelEvent::ConnectFailed { addr, attempts });
            }
        }
    }

    /// Make `stream` the active connection, preempting any existing one
    async fn adopt(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        internal_tx: &mpsc::UnboundedSender<Internal>,
        shutdown_tx: &watch::Sender<bool>,
        event_tx: &mpsc::UnboundedSender<ChannelEvent>,
    ) {
        let preempted = self.active.is_some();
        if preempted {
            info!("New connection from {} preempts the current one", peer);
            self.close_active(event_tx, true).await;
        }

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }

        self.next_conn_id += 1;
        let conn_id = self.next_conn_id;
        let (read_half, writer) = stream.into_split();
        let reader = tokio::spawn(read_frames(
            conn_id,
            read_half,
            internal_tx.clone(),
            shutdown_tx.subscribe(),
            self.config.io_timeout,
        ));

        self.active = Some(ActiveConnection {
            id: conn_id,
            peer,
            writer,
            reader,
        });
        self.connected.store(true, Ordering::Release);
        self.metrics.connection_established(peer.to_string(), preempted);
        let _ = event_tx.send(ChannelEvent::Connected { peer });
    }

    async fn close_active(&mut self, event_tx: &mpsc::UnboundedSender<ChannelEvent>, preempted: bool) {
        let Some(mut conn) = self.active.take() else {
            return;
        };
        conn.reader.abort();
        if let Err(e) = conn.writer.shutdown().await {
            debug!("Error shutting down writer for {}: {}", conn.peer, e);
        }
        self.connected.store(false, Ordering::Release);
        self.metrics.connection_closed();
        let _ = event_tx.send(ChannelEvent::Disconnected {
            peer: conn.peer,
            preempted,
        });
    }

    async fn write(&mut self, message: EnhancedMessage, event_tx: &mpsc::UnboundedSender<ChannelEvent>) {
        let Some(conn) = self.active.as_mut() else {
            debug!("No active connection, dropping {:?}", message.message_type());
            return;
        };

        let mut line = match message.encode() {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode {:?}: {}", message.message_type(), e);
                return;
            }
        };
        line.push('\n');

        let write = tokio::time::timeout(self.config.io_timeout, async {
            conn.writer.write_all(line.as_bytes()).await?;
            conn.writer.flush().await
        })
        .await;

        match write {
            Ok(Ok(())) => {
                trace!("Sent {:?} ({})", message.message_type(), message.message_id);
                self.metrics.update(|m| m.messages_sent += 1);
            }
            Ok(Err(e)) => {
                warn!("Write to {} failed: {}", conn.peer, e);
                self.close_active(event_tx, false).await;
            }
            Err(_) => {
                warn!("Write to {} timed out", conn.peer);
                self.close_active(event_tx, false).await;
            }
        }
    }

    fn dial(
        &mut self,
        addr: SocketAddr,
        internal_tx: &mpsc::UnboundedSender<Internal>,
        shutdown_rx: watch::Receiver<bool>,
    ) {
        if let Some(previous) = self.dialer.take() {
            debug!("Replacing pending connect attempt");
            previous.abort();
        }
        self.dialer = Some(tokio::spawn(connect_with_retry(
            addr,
            self.policy,
            self.config.io_timeout,
            internal_tx.clone(),
            shutdown_rx,
            self.metrics.clone(),
        )));
    }
}

/// Bind the listening port, backing off linearly between attempts
pub async fn bind_with_retry(port: u16, policy: &RetryPolicy) -> Result<TcpListener, ChannelError> {
    let mut attempt = 1;
    loop {
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => return Ok(listener),
            Err(source) if attempt >= policy.max_attempts => {
                return Err(ChannelError::Bind {
                    port,
                    attempts: attempt,
                    source,
                });
            }
            Err(e) => {
                let delay = policy.linear_delay(attempt);
                warn!(
                    "Bind on port {} failed (attempt {}/{}): {}, retrying in {:?}",
                    port, attempt, policy.max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

async fn accept_next(
    listener: Option<&TcpListener>,
    timeout: Duration,
) -> Option<std::io::Result<(TcpStream, SocketAddr)>> {
    match listener {
        Some(listener) => tokio::time::timeout(timeout, listener.accept()).await.ok(),
        None => std::future::pending().await,
    }
}

/// What the reader pulled off the socket
#[derive(Debug, PartialEq)]
enum Frame {
    /// One line, newline stripped. Not yet checked for UTF-8.
    Line(Vec<u8>),
    /// A line that grew past [`MAX_FRAME_LEN`]; the rest of it is skipped
    Oversized,
}

/// Splits a byte stream into newline-terminated frames of bounded length.
///
/// State lives in the struct between calls, so dropping a pending
/// `next_frame` (read timeout) loses nothing.
struct FrameReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    discarding: bool,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    fn new(inner: R, max_len: usize) -> Self {
        Self {
            inner: BufReader::new(inner),
            buf: Vec::new(),
            discarding: false,
            max_len,
        }
    }

    /// Next frame, or `None` at end of stream
    async fn next_frame(&mut self) -> std::io::Result<Option<Frame>> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                if self.discarding || self.buf.is_empty() {
                    return Ok(None);
                }
                // Unterminated last line
                return Ok(Some(Frame::Line(std::mem::take(&mut self.buf))));
            }

            let (used, complete) = match available.iter().position(|b| *b == b'\n') {
                Some(i) => (i + 1, true),
                None => (available.len(), false),
            };
            if !self.discarding {
                let end = if complete { used - 1 } else { used };
                self.buf.extend_from_slice(&available[..end]);
            }
            self.inner.consume(used);

            if self.discarding {
                if complete {
                    self.discarding = false;
                }
                continue;
            }
            if self.buf.len() > self.max_len {
                self.buf = Vec::new();
                self.discarding = !complete;
                return Ok(Some(Frame::Oversized));
            }
            if complete {
                return Ok(Some(Frame::Line(std::mem::take(&mut self.buf))));
            }
        }
    }
}

async fn read_frames(
    conn_id: u64,
    read_half: OwnedReadHalf,
    internal_tx: mpsc::UnboundedSender<Internal>,
    shutdown_rx: watch::Receiver<bool>,
    io_timeout: Duration,
) {
    let mut reader = FrameReader::new(read_half, MAX_FRAME_LEN);
    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        match tokio::time::timeout(io_timeout, reader.next_frame()).await {
            // Idle, check the shutdown flag again
            Err(_) => continue,
            Ok(Ok(Some(frame))) => {
                if let Frame::Line(bytes) = &frame {
                    if bytes.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                }
                if internal_tx.send(Internal::Frame { conn_id, frame }).is_err() {
                    return;
                }
            }
            Ok(Ok(None)) => {
                let _ = internal_tx.send(Internal::Closed {
                    conn_id,
                    reason: None,
                });
                return;
            }
            Ok(Err(e)) => {
                let _ = internal_tx.send(Internal::Closed {
                    conn_id,
                    reason: Some(e.to_string()),
                });
                return;
            }
        }
    }
}

async fn connect_with_retry(
    addr: SocketAddr,
    policy: RetryPolicy,
    io_timeout: Duration,
    internal_tx: mpsc::UnboundedSender<Internal>,
    mut shutdown_rx: watch::Receiver<bool>,
    metrics: SharedMetrics,
) {
    for attempt in 1..=policy.max_attempts {
        metrics.update(|m| m.reconnect_attempts += 1);
        match tokio::time::timeout(io_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let _ = internal_tx.send(Internal::Dialed { stream, peer: addr });
                return;
            }
            Ok(Err(e)) => warn!("Connect to {} failed (attempt {}): {}", addr, attempt, e),
            Err(_) => warn!("Connect to {} timed out (attempt {})", addr, attempt),
        }

        if attempt == policy.max_attempts {
            break;
        }

        let delay = policy.exponential_delay(attempt);
        debug!("Retrying {} in {:?}", addr, delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => return,
        }
    }

    let _ = internal_tx.send(Internal::DialFailed {
        addr,
        attempts: policy.max_attempts,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::device::DeviceCommand;
    use crate::protocol::{CommandPayload, ErrorCode, PingPayload, PongPayload};

    fn test_config() -> CoreConfig {
        let mut config = CoreConfig::default().with_device("device-test", "Test");
        config.server_port = 0;
        config.io_timeout = Duration::from_millis(200);
        config.retry_base_delay = Duration::from_millis(10);
        config.retry_max_jitter = Duration::ZERO;
        config.max_retry_attempts = 3;
        config
    }

    async fn start_server() -> (ChannelHandle, mpsc::UnboundedReceiver<ChannelEvent>, u16, SharedMetrics) {
        let metrics = SharedMetrics::new();
        let manager = ChannelManager::new(test_config(), Arc::new(MonotonicClock::new()), metrics.clone());
        let (handle, mut events) = manager.start().await.unwrap();
        let port = match events.recv().await {
            Some(ChannelEvent::Listening { port }) => port,
            other => panic!("expected Listening, got {:?}", other),
        };
        (handle, events, port, metrics)
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> ChannelEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_receives_frames() {
        let (handle, mut events, port, metrics) = start_server().await;
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        assert!(matches!(next_event(&mut events).await, ChannelEvent::Connected { .. }));

        let msg = EnhancedMessage::new(
            Payload::Command(CommandPayload::new(DeviceCommand::Status)),
            "controller",
            1,
        );
        let line = format!("{}\n", msg.encode().unwrap());
        client.write_all(line.as_bytes()).await.unwrap();

        match next_event(&mut events).await {
            ChannelEvent::Message { message, .. } => assert_eq!(message.message_id, msg.message_id),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(metrics.snapshot().messages_received, 1);
        assert!(handle.is_connected());
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection() {
        let (handle, mut events, port, metrics) = start_server().await;
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        assert!(matches!(next_event(&mut events).await, ChannelEvent::Connected { .. }));

        client.write_all(b"{not json\n").await.unwrap();
        client
            .write_all(b"{\"type\":\"TELEPORT\",\"messageId\":\"m-9\",\"payload\":{}}\n")
            .await
            .unwrap();

        match next_event(&mut events).await {
            ChannelEvent::DecodeFailed(e) => assert_eq!(e.error_code(), ErrorCode::NetworkError),
            other => panic!("unexpected {:?}", other),
        }
        match next_event(&mut events).await {
            ChannelEvent::DecodeFailed(e) => {
                assert_eq!(e.error_code(), ErrorCode::UnknownCommand);
                assert_eq!(e.message_id(), Some("m-9"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(metrics.snapshot().decode_errors, 2);
        assert!(handle.is_connected());
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_invalid_utf8_frame_keeps_connection() {
        let (handle, mut events, port, metrics) = start_server().await;
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        assert!(matches!(next_event(&mut events).await, ChannelEvent::Connected { .. }));

        client.write_all(b"{\"type\":\"PING\",\xff\xfe}\n").await.unwrap();
        match next_event(&mut events).await {
            ChannelEvent::DecodeFailed(e) => {
                assert!(matches!(e, DecodeError::InvalidUtf8(_)));
                assert_eq!(e.error_code(), ErrorCode::NetworkError);
            }
            other => panic!("unexpected {:?}", other),
        }

        // Still serving the same peer
        let ping = EnhancedMessage::new(Payload::Ping(PingPayload { timestamp: 1 }), "controller", 1);
        client
            .write_all(format!("{}\n", ping.encode().unwrap()).as_bytes())
            .await
            .unwrap();
        match next_event(&mut events).await {
            ChannelEvent::Message { message, .. } => assert_eq!(message.message_id, ping.message_id),
            other => panic!("unexpected {:?}", other),
        }
        assert!(handle.is_connected());
        assert_eq!(metrics.snapshot().decode_errors, 1);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_oversized_frame_is_skipped() {
        let (handle, mut events, port, _) = start_server().await;
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        assert!(matches!(next_event(&mut events).await, ChannelEvent::Connected { .. }));

        let mut huge = vec![b'x'; MAX_FRAME_LEN * 2];
        huge.push(b'\n');
        client.write_all(&huge).await.unwrap();
        let ping = EnhancedMessage::new(Payload::Ping(PingPayload { timestamp: 2 }), "controller", 1);
        client
            .write_all(format!("{}\n", ping.encode().unwrap()).as_bytes())
            .await
            .unwrap();

        match next_event(&mut events).await {
            ChannelEvent::DecodeFailed(e) => {
                assert!(matches!(e, DecodeError::FrameTooLong { limit: MAX_FRAME_LEN }));
                assert_eq!(e.error_code(), ErrorCode::NetworkError);
            }
            other => panic!("unexpected {:?}", other),
        }
        // Exactly one error for the long line, then the next frame decodes
        match next_event(&mut events).await {
            ChannelEvent::Message { message, .. } => assert_eq!(message.message_id, ping.message_id),
            other => panic!("unexpected {:?}", other),
        }
        assert!(handle.is_connected());
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_frame_reader_bounds_lines() {
        let input: &[u8] = b"short\nthis line is too long\nok\r\nlast";
        let mut reader = FrameReader::new(input, 8);

        assert_eq!(reader.next_frame().await.unwrap(), Some(Frame::Line(b"short".to_vec())));
        assert_eq!(reader.next_frame().await.unwrap(), Some(Frame::Oversized));
        assert_eq!(reader.next_frame().await.unwrap(), Some(Frame::Line(b"ok\r".to_vec())));
        assert_eq!(reader.next_frame().await.unwrap(), Some(Frame::Line(b"last".to_vec())));
        assert_eq!(reader.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_frame_reader_keeps_raw_bytes() {
        let input: &[u8] = b"\xff\xfe\n\n";
        let mut reader = FrameReader::new(input, 8);

        assert_eq!(reader.next_frame().await.unwrap(), Some(Frame::Line(vec![0xff, 0xfe])));
        assert_eq!(reader.next_frame().await.unwrap(), Some(Frame::Line(Vec::new())));
        assert_eq!(reader.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_replies_are_written_as_lines() {
        let (handle, mut events, port, _) = start_server().await;
        let client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        assert!(matches!(next_event(&mut events).await, ChannelEvent::Connected { .. }));

        handle
            .send_payload(Payload::Ping(PingPayload { timestamp: 42 }), None)
            .unwrap();

        let mut lines = BufReader::new(client).lines();
        let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let decoded = EnhancedMessage::decode(&line).unwrap();
        assert_eq!(decoded.payload, Payload::Ping(PingPayload { timestamp: 42 }));
        assert_eq!(decoded.device_id, "device-test");
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_new_connection_preempts_old() {
        let (handle, mut events, port, metrics) = start_server().await;

        let first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        assert!(matches!(next_event(&mut events).await, ChannelEvent::Connected { .. }));

        let _second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        assert!(matches!(
            next_event(&mut events).await,
            ChannelEvent::Disconnected { preempted: true, .. }
        ));
        assert!(matches!(next_event(&mut events).await, ChannelEvent::Connected { .. }));

        // The first socket sees EOF once its writer half is shut down
        let mut lines = BufReader::new(first).lines();
        let eof = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap();
        assert!(eof.is_none());

        let snap = metrics.snapshot();
        assert_eq!(snap.total_connections, 2);
        assert_eq!(snap.preempted_connections, 1);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_peer_close_emits_disconnected() {
        let (handle, mut events, port, _) = start_server().await;
        let client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        assert!(matches!(next_event(&mut events).await, ChannelEvent::Connected { .. }));

        drop(client);
        assert!(matches!(
            next_event(&mut events).await,
            ChannelEvent::Disconnected { preempted: false, .. }
        ));
        assert!(!handle.is_connected());
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_client_connects_to_server() {
        let (server, mut server_events, port, _) = start_server().await;

        let mut config = test_config();
        config.device_id = "controller".to_string();
        let client = ChannelManager::new(config, Arc::new(MonotonicClock::new()), SharedMetrics::new());
        let (client, mut client_events) = client.start_client();
        client.connect(SocketAddr::from(([127, 0, 0, 1], port))).unwrap();

        assert!(matches!(next_event(&mut client_events).await, ChannelEvent::Connected { .. }));
        assert!(matches!(next_event(&mut server_events).await, ChannelEvent::Connected { .. }));

        client
            .send_payload(Payload::Ping(PingPayload { timestamp: 7 }), None)
            .unwrap();
        match next_event(&mut server_events).await {
            ChannelEvent::Message { message, .. } => assert_eq!(message.device_id, "controller"),
            other => panic!("unexpected {:?}", other),
        }

        client.shutdown();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_max_attempts() {
        // Grab a free port and release it so nothing is listening there
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let metrics = SharedMetrics::new();
        let manager = ChannelManager::new(test_config(), Arc::new(MonotonicClock::new()), metrics.clone());
        let (handle, mut events) = manager.start_client();
        handle.connect(SocketAddr::from(([127, 0, 0, 1], port))).unwrap();

        match next_event(&mut events).await {
            ChannelEvent::ConnectFailed { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(metrics.snapshot().reconnect_attempts, 3);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_respond_reuses_message_id() {
        let (handle, mut commands) = ChannelHandle::detached("dev", Arc::new(MonotonicClock::new()));
        let request = EnhancedMessage::new(Payload::Ping(PingPayload { timestamp: 1 }), "ctl", 1)
            .with_session(Some("s1".to_string()));

        handle
            .respond(
                &request,
                Payload::Pong(PongPayload {
                    ping_timestamp: 1,
                    timestamp: 2,
                }),
            )
            .unwrap();

        match commands.recv().await {
            Some(ChannelCommand::Send(reply)) => {
                assert_eq!(reply.message_id, request.message_id);
                assert_eq!(reply.session_id.as_deref(), Some("s1"));
                assert!(!reply.requires_ack);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
