//! RPC client implementation.
//!
//! A client owns one multiplexed TCP link to a server. Calls are correlated
//! by request id through a pending table; a background sweep cancels calls
//! whose deadline passed, and the link's reader task keeps the connection
//! alive with heartbeats while detecting a silent peer.

use crate::error::{ConnectionError, Error, Result};
use crate::protocol::{BodyFormat, Frame, MAX_FRAME_SIZE, MessageType, ProtocolCodec, Request, Response};
use crate::transport::future::{CancelReason, ResponseFuture};
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until, timeout};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

type FrameSink = SplitSink<Framed<TcpStream, ProtocolCodec>, Frame>;
type FrameStream = SplitStream<Framed<TcpStream, ProtocolCodec>>;

/// Configuration for the RPC client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Bound on establishing the TCP connection.
    pub connect_timeout: Duration,
    /// Maximum calls awaiting a response. Further sends fail fast.
    pub max_in_flight: usize,
    /// Period of the expired-call sweep.
    pub sweep_interval: Duration,
    /// Send a heartbeat after this long without writing.
    pub heartbeat_interval: Duration,
    /// Close the link after this long without reading.
    pub read_idle_timeout: Duration,
    /// Maximum frame body size.
    pub max_frame_size: usize,
    /// Body serializer.
    pub body_format: BodyFormat,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            max_in_flight: 2000,
            sweep_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(2),
            read_idle_timeout: Duration::from_secs(20),
            max_frame_size: MAX_FRAME_SIZE,
            body_format: BodyFormat::default(),
        }
    }
}

/// Builder for creating RPC clients.
pub struct ClientBuilder {
    addr: Option<String>,
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a new client builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            addr: None,
            config: ClientConfig::default(),
        }
    }

    /// Set the `host:port` endpoint to connect to.
    #[must_use]
    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = Some(addr.into());
        self
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the in-flight call cap.
    #[must_use]
    pub const fn max_in_flight(mut self, max: usize) -> Self {
        self.config.max_in_flight = max;
        self
    }

    /// Set the write-idle heartbeat interval.
    #[must_use]
    pub const fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Set the read-idle timeout.
    #[must_use]
    pub const fn read_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_idle_timeout = timeout;
        self
    }

    /// Set the body serializer.
    #[must_use]
    pub const fn body_format(mut self, format: BodyFormat) -> Self {
        self.config.body_format = format;
        self
    }

    /// Build the RPC client without connecting.
    ///
    /// # Errors
    ///
    /// Returns an error if no address was given.
    pub fn build(self) -> Result<RpcClient> {
        let addr = self.addr.ok_or_else(|| {
            Error::from(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "Server address not specified",
            ))
        })?;

        Ok(RpcClient::new(addr, self.config))
    }

    /// Build the client and connect it.
    ///
    /// # Errors
    ///
    /// Returns an error if no address was given or the connection fails.
    pub async fn connect(self) -> Result<RpcClient> {
        let client = self.build()?;
        client.connect().await?;
        Ok(client)
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct PendingCall {
    future: ResponseFuture,
    link_id: u64,
}

type PendingTable = DashMap<u64, PendingCall>;

/// One TCP connection. Replaced wholesale on reconnect.
struct Link {
    id: u64,
    sink: tokio::sync::Mutex<FrameSink>,
    connected: AtomicBool,
    last_write: Mutex<Instant>,
    cancel: CancellationToken,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl Link {
    async fn send(&self, frame: Frame) -> Result<()> {
        let result = {
            let mut sink = self.sink.lock().await;
            sink.send(frame).await
        };

        match result {
            Ok(()) => {
                *self.last_write.lock() = Instant::now();
                Ok(())
            }
            Err(e) => {
                self.disconnect();
                Err(e)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        self.cancel.cancel();
    }

    fn write_idle(&self) -> Duration {
        self.last_write.lock().elapsed()
    }

    /// When a heartbeat is due if nothing else is written first.
    fn heartbeat_due(&self, interval: Duration) -> Instant {
        *self.last_write.lock() + interval
    }
}

/// RPC client for making calls over a single connection.
pub struct RpcClient {
    addr: String,
    config: ClientConfig,
    next_request_id: AtomicU64,
    next_link_id: AtomicU64,
    pending: Arc<PendingTable>,
    link: RwLock<Option<Arc<Link>>>,
    shutdown: CancellationToken,
    sweeper_started: AtomicBool,
}

impl RpcClient {
    /// Create a new client builder.
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Create an unconnected client for `addr` (`host:port`).
    #[must_use]
    pub fn new(addr: impl Into<String>, config: ClientConfig) -> Self {
        Self {
            addr: addr.into(),
            config,
            // Zero is reserved for heartbeats
            next_request_id: AtomicU64::new(1),
            next_link_id: AtomicU64::new(0),
            pending: Arc::new(DashMap::new()),
            link: RwLock::new(None),
            shutdown: CancellationToken::new(),
            sweeper_started: AtomicBool::new(false),
        }
    }

    /// Endpoint this client talks to.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Client configuration.
    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Whether a live link exists.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.live_link().is_some()
    }

    /// Whether [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Local socket address of the live link.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.live_link().map(|link| link.local_addr)
    }

    /// Remote socket address of the live link.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.live_link().map(|link| link.remote_addr)
    }

    /// Number of calls awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Connect if not already connected.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is closed or the connection fails.
    pub async fn connect(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ConnectionError::ShuttingDown.into());
        }
        if self.is_connected() {
            return Ok(());
        }
        self.open_link().await
    }

    /// Drop the current link, if any, and open a fresh one.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is closed or the connection fails.
    pub async fn reconnect(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ConnectionError::ShuttingDown.into());
        }
        if let Some(old) = self.link.write().take() {
            old.disconnect();
        }
        self.open_link().await
    }

    /// Send a request and return a handle to its eventual response.
    ///
    /// The request is registered before it is written, so a fast response
    /// cannot be lost. The write itself is bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Fails fast when not connected or when the in-flight cap is reached.
    /// Write failures and write timeouts are returned after the call has
    /// been removed from the pending table.
    #[instrument(skip(self, request), fields(addr = %self.addr))]
    pub async fn send(&self, mut request: Request, timeout: Duration) -> Result<ResponseFuture> {
        if self.is_closed() {
            return Err(ConnectionError::ShuttingDown.into());
        }
        let link = self.live_link().ok_or(ConnectionError::NotConnected)?;

        let current = self.pending.len();
        if current >= self.config.max_in_flight {
            return Err(ConnectionError::TooManyInFlight {
                current,
                max: self.config.max_in_flight,
            }
            .into());
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        request.request_id = request_id;
        request.message_type = MessageType::MessageRequest;
        request.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let frame = request.to_frame(self.config.body_format)?;

        let future = ResponseFuture::new(request_id, timeout);
        self.pending.insert(
            request_id,
            PendingCall {
                future: future.clone(),
                link_id: link.id,
            },
        );

        match tokio::time::timeout(timeout, link.send(frame)).await {
            Ok(Ok(())) => {
                debug!("Sent request {} (in flight: {})", request_id, self.pending.len());
                Ok(future)
            }
            Ok(Err(e)) => {
                warn!("Failed to write request {}: {}", request_id, e);
                self.abandon(request_id, CancelReason::WriteFailed(e.to_string()));
                Err(e)
            }
            Err(_) => {
                warn!("Timed out writing request {}", request_id);
                self.abandon(request_id, CancelReason::Timeout);
                Err(Error::Timeout(timeout))
            }
        }
    }

    /// Send a request and wait for its response.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send) and [`ResponseFuture::get`].
    pub async fn call(&self, request: Request, timeout: Duration) -> Result<Response> {
        self.send(request, timeout).await?.get().await
    }

    /// Close the client: stop background tasks, drop the link and cancel
    /// every pending call.
    pub fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        debug!("Closing RPC client for {}", self.addr);

        self.shutdown.cancel();
        if let Some(link) = self.link.write().take() {
            link.disconnect();
        }
        fail_pending(&self.pending, None, &CancelReason::Shutdown);
    }

    fn live_link(&self) -> Option<Arc<Link>> {
        self.link
            .read()
            .as_ref()
            .filter(|link| link.is_connected())
            .cloned()
    }

    fn abandon(&self, request_id: u64, reason: CancelReason) {
        if let Some((_, call)) = self.pending.remove(&request_id) {
            call.future.cancel_with(reason);
        }
    }

    async fn open_link(&self) -> Result<()> {
        let stream = timeout(self.config.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| Error::Timeout(self.config.connect_timeout))?
            .map_err(|source| ConnectionError::ConnectFailed {
                addr: self.addr.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;

        let codec = ProtocolCodec::new().with_max_frame_size(self.config.max_frame_size);
        let (sink, stream) = Framed::new(stream, codec).split();

        let link = Arc::new(Link {
            id: self.next_link_id.fetch_add(1, Ordering::Relaxed),
            sink: tokio::sync::Mutex::new(sink),
            connected: AtomicBool::new(true),
            last_write: Mutex::new(Instant::now()),
            cancel: self.shutdown.child_token(),
            local_addr,
            remote_addr,
        });

        tokio::spawn(read_loop(
            Arc::clone(&link),
            stream,
            Arc::clone(&self.pending),
            self.config.clone(),
        ));
        self.start_sweeper();

        info!("Connected {} -> {}", local_addr, remote_addr);
        if let Some(old) = self.link.write().replace(link) {
            old.disconnect();
        }

        Ok(())
    }

    fn start_sweeper(&self) {
        if self.sweeper_started.swap(true, Ordering::AcqRel) {
            return;
        }

        let pending = Arc::clone(&self.pending);
        let shutdown = self.shutdown.clone();
        let period = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let swept = sweep_expired(&pending, Instant::now());
                        if swept > 0 {
                            debug!("Swept {} expired calls", swept);
                        }
                    }
                }
            }
        });
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("addr", &self.addr)
            .field("connected", &self.is_connected())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

/// Cancel every pending call past its deadline. Returns how many were taken.
fn sweep_expired(pending: &PendingTable, now: Instant) -> usize {
    let expired: Vec<u64> = pending
        .iter()
        .filter(|call| call.future.is_expired(now))
        .map(|call| *call.key())
        .collect();

    let mut swept = 0;
    for request_id in expired {
        // Whoever removes the entry first owns its completion
        if let Some((_, call)) = pending.remove(&request_id) {
            call.future.cancel_with(CancelReason::Timeout);
            swept += 1;
        }
    }
    swept
}

/// Cancel pending calls, either all of them or those riding on one link.
fn fail_pending(pending: &PendingTable, link_id: Option<u64>, reason: &CancelReason) {
    let doomed: Vec<u64> = pending
        .iter()
        .filter(|call| link_id.is_none_or(|id| call.link_id == id))
        .map(|call| *call.key())
        .collect();

    for request_id in doomed {
        if let Some((_, call)) = pending.remove(&request_id) {
            call.future.cancel_with(reason.clone());
        }
    }
}

fn handle_frame(frame: &Frame, pending: &PendingTable, format: BodyFormat) {
    match frame.message_type {
        MessageType::MessageResponse => {
            let Some((_, call)) = pending.remove(&frame.request_id) else {
                warn!(
                    "Received response for unknown request {} (already timed out?)",
                    frame.request_id
                );
                return;
            };

            match Response::from_frame(frame, format) {
                Ok(response) => {
                    call.future.complete(response);
                }
                Err(e) => {
                    error!("Failed to decode response {}: {}", frame.request_id, e);
                    call.future
                        .cancel_with(CancelReason::BadResponse(e.to_string()));
                }
            }
        }
        MessageType::HeartbeatResponse => {
            debug!("Heartbeat acknowledged");
        }
        other => {
            warn!("Unexpected {} frame from server", other);
        }
    }
}

async fn read_loop(
    link: Arc<Link>,
    mut stream: FrameStream,
    pending: Arc<PendingTable>,
    config: ClientConfig,
) {
    let mut last_read = Instant::now();

    loop {
        let idle_deadline = last_read + config.read_idle_timeout;
        let heartbeat_due = link.heartbeat_due(config.heartbeat_interval);

        tokio::select! {
            () = link.cancel.cancelled() => {
                debug!("Link {} cancelled", link.id);
                break;
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(frame)) => {
                        last_read = Instant::now();
                        handle_frame(&frame, &pending, config.body_format);
                    }
                    Some(Err(e)) => {
                        error!("Stream error on link {}: {}", link.id, e);
                        break;
                    }
                    None => {
                        debug!("Link {} closed by server", link.id);
                        break;
                    }
                }
            }
            () = sleep_until(idle_deadline) => {
                warn!(
                    "No reads from {} for {:?}, closing link",
                    link.remote_addr, config.read_idle_timeout
                );
                break;
            }
            () = sleep_until(heartbeat_due) => {
                // Another write may have landed while we slept
                if link.write_idle() >= config.heartbeat_interval {
                    if let Err(e) = link.send(Frame::heartbeat_request(0)).await {
                        warn!("Heartbeat to {} failed: {}", link.remote_addr, e);
                        break;
                    }
                }
            }
        }
    }

    link.disconnect();
    fail_pending(&pending, Some(link.id), &CancelReason::Disconnected);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_builder() {
        let client = RpcClient::builder()
            .addr("127.0.0.1:8404")
            .max_in_flight(5)
            .heartbeat_interval(Duration::from_secs(1))
            .build()
            .unwrap();

        // Connection happens lazily
        assert!(!client.is_connected());
        assert_eq!(client.config().max_in_flight, 5);
        assert_eq!(client.addr(), "127.0.0.1:8404");
    }

    #[test]
    fn test_builder_requires_addr() {
        assert!(RpcClient::builder().build().is_err());
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let client = RpcClient::new("127.0.0.1:1", ClientConfig::default());
        let err = client
            .send(Request::new("x"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let pending = PendingTable::new();
        let expired = ResponseFuture::new(1, Duration::ZERO);
        let live = ResponseFuture::new(2, Duration::from_secs(60));
        pending.insert(
            1,
            PendingCall {
                future: expired.clone(),
                link_id: 0,
            },
        );
        pending.insert(
            2,
            PendingCall {
                future: live.clone(),
                link_id: 0,
            },
        );

        assert_eq!(sweep_expired(&pending, Instant::now()), 1);
        assert!(expired.is_cancelled());
        assert!(!live.is_done());
        assert_eq!(pending.len(), 1);

        // Second sweep finds nothing new
        assert_eq!(sweep_expired(&pending, Instant::now()), 0);
    }

    #[tokio::test]
    async fn test_fail_pending_scoped_to_link() {
        let pending = PendingTable::new();
        let old = ResponseFuture::new(1, Duration::from_secs(60));
        let new = ResponseFuture::new(2, Duration::from_secs(60));
        pending.insert(
            1,
            PendingCall {
                future: old.clone(),
                link_id: 0,
            },
        );
        pending.insert(
            2,
            PendingCall {
                future: new.clone(),
                link_id: 1,
            },
        );

        fail_pending(&pending, Some(0), &CancelReason::Disconnected);

        assert!(old.is_cancelled());
        assert!(!new.is_done());
    }

    #[tokio::test]
    async fn test_unknown_response_is_dropped() {
        let pending = PendingTable::new();
        let frame = Response::success(99, bytes::Bytes::new())
            .to_frame(BodyFormat::Bincode)
            .unwrap();

        handle_frame(&frame, &pending, BodyFormat::Bincode);
        assert!(pending.is_empty());
    }
}
