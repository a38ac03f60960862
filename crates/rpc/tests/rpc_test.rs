//! End-to-end tests for client, server and pool over loopback TCP.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use relay_rpc::{
    ClientConfig, ClientPool, ConnectionError, Error, Frame, HandlerError, MessageType, PoolConfig,
    ProtocolCodec, Request, RequestHandler, RpcClient, RpcServer, ServerConfig,
};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

struct TestHandler;

#[async_trait]
impl RequestHandler for TestHandler {
    async fn handle(&self, request: Request) -> Result<Bytes, HandlerError> {
        match request.attachments.get("mode").map(String::as_str) {
            Some("fail") => Err(HandlerError::Internal("requested failure".to_string())),
            Some("sleep") => {
                let ms = request
                    .attachments
                    .get("ms")
                    .and_then(|ms| ms.parse().ok())
                    .unwrap_or(500);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(request.payload)
            }
            _ => Ok(request.payload),
        }
    }
}

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

async fn start_server() -> RpcServer {
    let server = RpcServer::bind(loopback(), TestHandler, ServerConfig::default())
        .await
        .expect("bind");
    server.start();
    server
}

async fn connect(server: &RpcServer, config: ClientConfig) -> RpcClient {
    let client = RpcClient::new(server.local_addr().to_string(), config);
    client.connect().await.expect("connect");
    client
}

fn sleepy(ms: u64) -> Request {
    Request::new("slow")
        .with_attachment("mode", "sleep")
        .with_attachment("ms", ms.to_string())
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_call_roundtrip() {
    let server = start_server().await;
    let client = connect(&server, ClientConfig::default()).await;

    let response = client
        .call(Request::new("ping"), Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(response.payload, Bytes::from_static(b"ping"));
    assert!(response.is_ok());
    assert_eq!(response.timeout_ms, 5000);
    assert_eq!(client.pending_count(), 0);

    client.close();
    server.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_calls_are_correlated() {
    let server = start_server().await;
    let client = std::sync::Arc::new(connect(&server, ClientConfig::default()).await);

    let mut handles = Vec::new();
    for i in 0..50 {
        let client = std::sync::Arc::clone(&client);
        handles.push(tokio::spawn(async move {
            let payload = format!("call-{i}");
            let response = client
                .call(Request::new(payload.clone()), Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(response.payload, Bytes::from(payload));
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_handler_error_is_returned_as_data() {
    let server = start_server().await;
    let client = connect(&server, ClientConfig::default()).await;

    let response = client
        .call(
            Request::new("x").with_attachment("mode", "fail"),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    let error = response.error.expect("remote error");
    assert_eq!(error.code, "INTERNAL_ERROR");
    assert!(error.message.contains("requested failure"));

    // Connection survives a failing handler
    assert!(client.call(Request::new("again"), Duration::from_secs(5)).await.is_ok());

    server.shutdown().await;
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_call_times_out_within_sweep_period() {
    let server = start_server().await;
    let client = connect(&server, ClientConfig::default()).await;
    let timeout = Duration::from_millis(150);

    let started = Instant::now();
    let err = client.call(sleepy(1000), timeout).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, Error::Timeout(t) if t == timeout));
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_millis(400));

    // The sweep takes the entry out of the pending table
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(client.pending_count(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_unbounded_call_does_not_stop_the_sweep() {
    let server = start_server().await;
    let client = connect(&server, ClientConfig::default()).await;

    let forever = client.send(sleepy(600), Duration::MAX).await.unwrap();
    let short = client
        .send(sleepy(300), Duration::from_millis(50))
        .await
        .unwrap();

    // Nobody waits on `short`; only the sweep can time it out
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(short.is_cancelled());
    assert!(!forever.is_done());
    assert_eq!(client.pending_count(), 1);

    client.close();
    server.shutdown().await;
}

#[tokio::test]
async fn test_in_flight_cap_fails_fast() {
    let server = start_server().await;
    let client = connect(
        &server,
        ClientConfig {
            max_in_flight: 1,
            ..ClientConfig::default()
        },
    )
    .await;

    let first = client.send(sleepy(300), Duration::from_secs(5)).await.unwrap();
    let err = client
        .send(Request::new("second"), Duration::from_secs(5))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Connection(ConnectionError::TooManyInFlight { current: 1, max: 1 })
    ));
    assert!(first.get().await.is_ok());

    server.shutdown().await;
}

#[tokio::test]
async fn test_bind_with_retry_moves_to_next_port() {
    let squatter = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let taken = squatter.local_addr().unwrap().port();

    let server =
        RpcServer::bind_with_retry("127.0.0.1", taken, TestHandler, ServerConfig::default())
            .await
            .unwrap();

    assert!(server.local_addr().port() > taken);

    // The reported port is the one actually serving
    server.start();
    let client = connect(&server, ClientConfig::default()).await;
    assert!(client.call(Request::new("hi"), Duration::from_secs(5)).await.is_ok());

    server.shutdown().await;
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_bad_magic_closes_connection() {
    let server = start_server().await;
    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();

    stream.write_all(&[0xAB; 16]).await.unwrap();

    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("server should close the connection");
    assert!(matches!(read, Ok(0) | Err(_)));

    server.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_is_answered_inline() {
    let server = start_server().await;
    let stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut framed = Framed::new(stream, ProtocolCodec::new());

    framed.send(Frame::heartbeat_request(77)).await.unwrap();
    let reply = framed.next().await.unwrap().unwrap();

    assert_eq!(reply.message_type, MessageType::HeartbeatResponse);
    assert_eq!(reply.request_id, 77);

    server.shutdown().await;
}

#[tokio::test]
async fn test_garbage_heartbeat_body_still_answered() {
    let server = start_server().await;
    let stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut framed = Framed::new(stream, ProtocolCodec::new());

    framed
        .send(Frame::new(
            MessageType::HeartbeatRequest,
            5,
            Bytes::from_static(&[0xFF, 0x00, 0xFF]),
        ))
        .await
        .unwrap();
    let reply = framed.next().await.unwrap().unwrap();

    assert_eq!(reply.message_type, MessageType::HeartbeatResponse);

    server.shutdown().await;
}

#[tokio::test]
async fn test_peer_disconnect_cancels_pending_calls() {
    // A peer that reads one frame and hangs up without answering
    let listener = TcpListener::bind(loopback()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, ProtocolCodec::new());
        let _ = framed.next().await;
    });

    let client = RpcClient::new(addr.to_string(), ClientConfig::default());
    client.connect().await.unwrap();

    let started = Instant::now();
    let err = client
        .call(Request::new("lost"), Duration::from_secs(10))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Connection(ConnectionError::Closed)));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_silent_peer_hits_read_idle_timeout() {
    // A peer that accepts and never writes
    let listener = TcpListener::bind(loopback()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink).await;
    });

    let client = RpcClient::new(
        addr.to_string(),
        ClientConfig {
            heartbeat_interval: Duration::from_millis(50),
            read_idle_timeout: Duration::from_millis(200),
            ..ClientConfig::default()
        },
    );
    client.connect().await.unwrap();
    assert!(client.is_connected());

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_heartbeats_keep_idle_link_alive() {
    let server = start_server().await;
    let client = connect(
        &server,
        ClientConfig {
            heartbeat_interval: Duration::from_millis(50),
            read_idle_timeout: Duration::from_millis(300),
            ..ClientConfig::default()
        },
    )
    .await;

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert!(client.is_connected());

    server.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_is_scheduled_from_last_write() {
    let listener = TcpListener::bind(loopback()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, ProtocolCodec::new());
        while let Some(Ok(frame)) = framed.next().await {
            let _ = seen_tx.send((tokio::time::Instant::now(), frame.message_type));
        }
    });

    let interval = Duration::from_millis(200);
    let client = RpcClient::new(
        addr.to_string(),
        ClientConfig {
            heartbeat_interval: interval,
            ..ClientConfig::default()
        },
    );
    client.connect().await.unwrap();

    // Write just after the first heartbeat is due
    tokio::time::sleep(Duration::from_millis(230)).await;
    let _pending = client
        .send(Request::new("x"), Duration::from_secs(5))
        .await
        .unwrap();

    let written = loop {
        let (at, kind) = seen_rx.recv().await.unwrap();
        if kind == MessageType::MessageRequest {
            break at;
        }
    };
    let (beat, kind) = seen_rx.recv().await.unwrap();
    assert_eq!(kind, MessageType::HeartbeatRequest);

    let gap = beat - written;
    assert!(gap >= interval - Duration::from_millis(30), "heartbeat after {gap:?}");
    assert!(gap < interval + Duration::from_millis(120), "heartbeat after {gap:?}");

    client.close();
}

#[tokio::test]
async fn test_reconnect_replaces_link() {
    let server = start_server().await;
    let client = connect(&server, ClientConfig::default()).await;
    let first = client.local_addr().unwrap();

    client.reconnect().await.unwrap();

    assert_ne!(client.local_addr().unwrap(), first);
    assert!(client.call(Request::new("hi"), Duration::from_secs(5)).await.is_ok());

    server.shutdown().await;
}

#[tokio::test]
async fn test_closed_client_refuses_calls() {
    let server = start_server().await;
    let client = connect(&server, ClientConfig::default()).await;
    client.close();

    let err = client
        .send(Request::new("x"), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Connection(ConnectionError::ShuttingDown)));
    assert!(client.connect().await.is_err());

    server.shutdown().await;
}

#[tokio::test]
async fn test_pool_reuses_released_client() {
    let server = start_server().await;
    let pool = ClientPool::new(
        server.local_addr().to_string(),
        ClientConfig::default(),
        PoolConfig::default(),
    );

    let client = pool.borrow().await.unwrap();
    let local = client.local_addr().unwrap();
    assert_eq!(pool.active_count(), 1);
    client.release();

    assert_eq!(pool.active_count(), 0);
    assert_eq!(pool.idle_count(), 1);

    let again = pool.borrow().await.unwrap();
    assert_eq!(again.local_addr().unwrap(), local);
    drop(again);
    assert_eq!(pool.idle_count(), 1);

    pool.close();
    server.shutdown().await;
}

#[tokio::test]
async fn test_pool_invalidate_discards_client() {
    let server = start_server().await;
    let pool = ClientPool::new(
        server.local_addr().to_string(),
        ClientConfig::default(),
        PoolConfig::default(),
    );

    let client = pool.borrow().await.unwrap();
    client.invalidate();

    assert_eq!(pool.active_count(), 0);
    assert_eq!(pool.idle_count(), 0);

    pool.close();
    server.shutdown().await;
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_pool_exhaustion_within_max_wait() {
    let server = start_server().await;
    let max_wait = Duration::from_millis(100);
    let pool = ClientPool::new(
        server.local_addr().to_string(),
        ClientConfig::default(),
        PoolConfig {
            max_total: 1,
            max_wait,
            ..PoolConfig::default()
        },
    );

    let held = pool.borrow().await.unwrap();
    let shown = format!("{held:?}");
    assert!(shown.starts_with("PooledClient"));
    assert!(shown.contains(&server.local_addr().to_string()));

    let started = Instant::now();
    let err = pool.borrow().await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, Error::PoolExhausted(_)));
    assert!(elapsed >= max_wait);
    assert!(elapsed < max_wait + Duration::from_millis(300));

    // Capacity returns with the guard
    held.release();
    assert!(pool.borrow().await.is_ok());

    pool.close();
    server.shutdown().await;
}

#[tokio::test]
async fn test_pool_reconnects_stale_idle_client() {
    let server = start_server().await;
    let pool = ClientPool::new(
        server.local_addr().to_string(),
        ClientConfig::default(),
        PoolConfig::default(),
    );

    let client = pool.borrow().await.unwrap();
    let stale = client.local_addr().unwrap();
    client.release();

    // Server-side close leaves the idle client disconnected
    server.shutdown().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let server = RpcServer::bind(
        SocketAddr::from(([127, 0, 0, 1], stale_port(&pool))),
        TestHandler,
        ServerConfig::default(),
    )
    .await;

    // The port may have been grabbed by someone else in the meantime
    if let Ok(server) = server {
        server.start();
        let client = pool.borrow().await.unwrap();
        assert_ne!(client.local_addr().unwrap(), stale);
        assert!(client.call(Request::new("hi"), Duration::from_secs(5)).await.is_ok());
        client.release();
        server.shutdown().await;
    }

    pool.close();
}

fn stale_port(pool: &ClientPool) -> u16 {
    pool.addr()
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .unwrap()
}
