//! RPC server implementation.

use crate::error::{HandlerError, Result};
use crate::protocol::{BodyFormat, Frame, MAX_FRAME_SIZE, MessageType, ProtocolCodec, RemoteError, Request, Response};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{FutureExt, SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

/// Configuration for the RPC server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Close a connection after this long without reading.
    pub idle_timeout: Duration,
    /// Maximum frame body size.
    pub max_frame_size: usize,
    /// How long shutdown waits for open connections to drain.
    pub shutdown_grace: Duration,
    /// Body serializer.
    pub body_format: BodyFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            idle_timeout: Duration::from_secs(60),
            max_frame_size: MAX_FRAME_SIZE,
            shutdown_grace: Duration::from_secs(5),
            body_format: BodyFormat::default(),
        }
    }
}

/// Trait for handling RPC requests.
///
/// Returning an error does not fail the call at the transport level; the
/// error travels back to the caller inside the response.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle an incoming request and produce the response payload.
    async fn handle(&self, request: Request) -> std::result::Result<Bytes, HandlerError>;
}

/// RPC server that listens for incoming connections.
pub struct RpcServer {
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    handler: Arc<dyn RequestHandler>,
    config: ServerConfig,
    shutdown: CancellationToken,
    connections: TaskTracker,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcServer {
    /// Bind to `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind<H: RequestHandler>(
        addr: SocketAddr,
        handler: H,
        config: ServerConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Self::from_listener(listener, Arc::new(handler), config)
    }

    /// Bind to `host:start_port`, moving to the next port while the
    /// current one is in use.
    ///
    /// # Errors
    ///
    /// Returns the first bind error that is not `AddrInUse`, or `AddrInUse`
    /// once the port range is exhausted.
    pub async fn bind_with_retry<H: RequestHandler>(
        host: &str,
        start_port: u16,
        handler: H,
        config: ServerConfig,
    ) -> Result<Self> {
        let handler: Arc<dyn RequestHandler> = Arc::new(handler);
        let mut port = start_port;

        loop {
            match TcpListener::bind((host, port)).await {
                Ok(listener) => return Self::from_listener(listener, handler, config),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    warn!("Port {} in use, trying {}", port, port.wrapping_add(1));
                    port = port.checked_add(1).ok_or(e)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn from_listener(
        listener: TcpListener,
        handler: Arc<dyn RequestHandler>,
        config: ServerConfig,
    ) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        info!("RPC server bound to {}", local_addr);

        Ok(Self {
            local_addr,
            listener: Mutex::new(Some(listener)),
            handler,
            config,
            shutdown: CancellationToken::new(),
            connections: TaskTracker::new(),
            accept_task: Mutex::new(None),
        })
    }

    /// Address actually bound.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connections currently being served.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Start accepting connections in the background.
    ///
    /// Calling this more than once has no further effect.
    pub fn start(&self) {
        let Some(listener) = self.listener.lock().take() else {
            debug!("RPC server on {} already started", self.local_addr);
            return;
        };

        let handler = Arc::clone(&self.handler);
        let config = self.config.clone();
        let shutdown = self.shutdown.clone();
        let connections = self.connections.clone();

        let task = tokio::spawn(accept_loop(listener, handler, config, shutdown, connections));
        *self.accept_task.lock() = Some(task);
    }

    /// Stop accepting, let open connections finish the request they are
    /// handling, and wait for them up to the configured grace period.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down RPC server on {}", self.local_addr);

        self.shutdown.cancel();
        self.listener.lock().take();

        let accept_task = self.accept_task.lock().take();
        if let Some(task) = accept_task {
            if let Err(e) = task.await {
                warn!("Accept loop failed: {}", e);
            }
        }

        self.connections.close();
        if timeout(self.config.shutdown_grace, self.connections.wait())
            .await
            .is_err()
        {
            warn!(
                "{} connections still open after {:?}",
                self.connections.len(),
                self.config.shutdown_grace
            );
        }
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    config: ServerConfig,
    shutdown: CancellationToken,
    connections: TaskTracker,
) {
    let semaphore = Arc::new(Semaphore::new(config.max_connections));

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                debug!("Accept loop stopping");
                break;
            }
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, addr)) => {
                        let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                            warn!("Max connections reached, rejecting connection from {}", addr);
                            continue;
                        };

                        let handler = Arc::clone(&handler);
                        let config = config.clone();
                        let shutdown = shutdown.clone();
                        connections.spawn(async move {
                            handle_connection(stream, addr, handler, config, shutdown).await;
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }
}

#[instrument(skip(stream, handler, config, shutdown))]
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    handler: Arc<dyn RequestHandler>,
    config: ServerConfig,
    shutdown: CancellationToken,
) {
    debug!("New connection from {}", addr);
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }

    let codec = ProtocolCodec::new().with_max_frame_size(config.max_frame_size);
    let mut framed = Framed::new(stream, codec);

    loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => {
                debug!("Closing connection from {} for shutdown", addr);
                break;
            }
            next = timeout(config.idle_timeout, framed.next()) => next,
        };

        let frame = match next {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                warn!("Closing connection from {}: {}", addr, e);
                break;
            }
            Ok(None) => {
                debug!("Connection closed by {}", addr);
                break;
            }
            Err(_) => {
                info!("Connection from {} idle for {:?}, closing", addr, config.idle_timeout);
                break;
            }
        };

        let reply = match frame.message_type {
            MessageType::HeartbeatRequest => Some(Frame::heartbeat_response(frame.request_id)),
            MessageType::MessageRequest => {
                dispatch(&frame, handler.as_ref(), config.body_format).await
            }
            other => {
                warn!("Unexpected {} frame from {}", other, addr);
                None
            }
        };

        if let Some(reply) = reply {
            if let Err(e) = framed.send(reply).await {
                error!("Failed to send reply to {}: {}", addr, e);
                break;
            }
        }
    }
}

/// Run the handler for one request frame and build the reply frame.
///
/// Malformed bodies, handler errors and handler panics all become a
/// response carrying an error; the connection stays open.
async fn dispatch(frame: &Frame, handler: &dyn RequestHandler, format: BodyFormat) -> Option<Frame> {
    let started = Instant::now();
    let request_id = frame.request_id;

    let mut response = match Request::from_frame(frame, format) {
        Err(e) => {
            warn!("Bad request body for {}: {}", request_id, e);
            Response::failure(
                request_id,
                RemoteError::from(&HandlerError::BadRequest(e.to_string())),
            )
        }
        Ok(request) => {
            let timeout_ms = request.timeout_ms;
            let outcome = AssertUnwindSafe(handler.handle(request)).catch_unwind().await;
            let mut response = match outcome {
                Ok(Ok(payload)) => Response::success(request_id, payload),
                Ok(Err(e)) => {
                    debug!("Handler failed for request {}: {}", request_id, e);
                    Response::failure(request_id, RemoteError::from(&e))
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!("Handler panicked on request {}: {}", request_id, message);
                    Response::failure(request_id, RemoteError::from(&HandlerError::Panicked(message)))
                }
            };
            response.timeout_ms = timeout_ms;
            response
        }
    };

    response.process_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    match response.to_frame(format) {
        Ok(reply) => Some(reply),
        Err(e) => {
            error!("Failed to encode response {}: {}", request_id, e);
            None
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, request: Request) -> std::result::Result<Bytes, HandlerError> {
            match request.payload.as_ref() {
                b"fail" => Err(HandlerError::Internal("asked to fail".to_string())),
                b"panic" => panic!("asked to panic"),
                _ => Ok(request.payload),
            }
        }
    }

    fn request_frame(payload: &'static [u8]) -> Frame {
        let mut request = Request::new(Bytes::from_static(payload));
        request.request_id = 11;
        request.to_frame(BodyFormat::Bincode).unwrap()
    }

    async fn reply_to(frame: &Frame) -> Response {
        let reply = dispatch(frame, &Echo, BodyFormat::Bincode).await.unwrap();
        assert_eq!(reply.message_type, MessageType::MessageResponse);
        Response::from_frame(&reply, BodyFormat::Bincode).unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        let response = reply_to(&request_frame(b"hello")).await;
        assert_eq!(response.request_id, 11);
        assert_eq!(response.payload, Bytes::from_static(b"hello"));
        assert!(response.is_ok());
    }

    #[tokio::test]
    async fn test_dispatch_handler_error_is_data() {
        let response = reply_to(&request_frame(b"fail")).await;
        assert_eq!(response.error.unwrap().code, "INTERNAL_ERROR");
    }

    #[tokio::test]
    async fn test_dispatch_panic_is_data() {
        let response = reply_to(&request_frame(b"panic")).await;
        let error = response.error.unwrap();
        assert_eq!(error.code, "HANDLER_PANICKED");
        assert!(error.message.contains("asked to panic"));
    }

    #[tokio::test]
    async fn test_dispatch_bad_body() {
        let frame = Frame::new(
            MessageType::MessageRequest,
            12,
            Bytes::from_static(&[0xFF, 0xFF, 0xFF]),
        );
        let response = reply_to(&frame).await;
        assert_eq!(response.request_id, 12);
        assert_eq!(response.error.unwrap().code, "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_bind_reports_ephemeral_port() {
        let server = RpcServer::bind(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            Echo,
            ServerConfig::default(),
        )
        .await
        .unwrap();

        assert_ne!(server.local_addr().port(), 0);
        server.start();
        server.shutdown().await;
    }
}
