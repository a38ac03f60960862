//! Binary RPC over TCP for routing events between cluster nodes.
//!
//! This crate provides a small, multiplexed request/response protocol with
//! a fixed 16 byte frame header, pluggable body serialization, future-based
//! calls with deadlines, heartbeat liveness and per-endpoint client pools.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use relay_rpc::{Request, RpcClient};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = RpcClient::builder()
//!         .addr("127.0.0.1:8404")
//!         .connect()
//!         .await?;
//!
//!     let response = client
//!         .call(Request::new("hello"), Duration::from_secs(10))
//!         .await?;
//!
//!     if let Some(error) = response.error {
//!         eprintln!("remote handler failed: {error}");
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use error::{CodecError, ConnectionError, Error, HandlerError, ProtocolError, Result};
pub use protocol::{BodyFormat, Frame, MessageType, ProtocolCodec, RemoteError, Request, Response};
pub use transport::{
    client::{ClientBuilder, ClientConfig, RpcClient},
    future::{CancelReason, Completion, FutureState, ResponseFuture},
    pool::{ClientPool, ClientPools, PoolConfig, PooledClient},
    server::{RequestHandler, RpcServer, ServerConfig},
};

// Re-export dependencies that are part of our public API
pub use bytes::Bytes;
