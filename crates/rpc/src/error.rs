//! Error types for the RPC layer.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::transport::future::CancelReason;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by clients, servers and pools.
#[derive(Debug, Error)]
pub enum Error {
    /// Link setup or teardown failed.
    #[error("connection: {0}")]
    Connection(#[from] ConnectionError),

    /// Peer violated the wire format.
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),

    /// Codec errors during serialization/deserialization of a frame body.
    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    /// Remote handler failure carried back in a response.
    #[error("handler: {0}")]
    Handler(#[from] HandlerError),

    /// Call or write did not complete within its deadline.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The call was cancelled before a response arrived.
    #[error("call cancelled: {0}")]
    Cancelled(CancelReason),

    /// No pooled client became available within the wait bound.
    #[error("no pooled client for {0}")]
    PoolExhausted(String),

    /// Generic I/O error.
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the error leaves the underlying connection usable.
    ///
    /// Timeouts and remote handler failures do not poison a connection;
    /// everything else does.
    #[must_use]
    pub const fn is_connection_healthy(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Handler(_) | Self::Codec(_))
    }
}

/// Link failures.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// TCP connect failed or timed out.
    #[error("connect to {addr} failed: {source}")]
    ConnectFailed {
        /// The endpoint we tried to connect to.
        addr: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// No live link to the remote endpoint.
    #[error("not connected")]
    NotConnected,

    /// Peer went away while calls were outstanding.
    #[error("link closed by peer")]
    Closed,

    /// In-flight cap reached on this client.
    #[error("{current} of {max} calls already in flight")]
    TooManyInFlight {
        /// Calls pending when the request was refused.
        current: usize,
        /// Configured cap.
        max: usize,
    },

    /// Client was closed.
    #[error("client closed")]
    ShuttingDown,
}

/// Protocol-level errors. Any of these closes the connection that produced it.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame did not start with the protocol magic.
    #[error("Bad magic: {0:#06x}")]
    BadMagic(u16),

    /// Message type byte is not one we know.
    #[error("Unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    /// Reserved extension byte was non-zero.
    #[error("Reserved extension byte set: {0:#04x}")]
    ReservedExtension(u8),

    /// Frame too large.
    #[error("body of {size} bytes over the {max} byte limit")]
    FrameTooLarge {
        /// Size of the frame body.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Frame type did not fit the direction it arrived on.
    #[error("got {actual} where {expected} was expected")]
    UnexpectedMessageType {
        /// Type valid in this direction.
        expected: String,
        /// Type that arrived.
        actual: String,
    },
}

/// Body serialization failures.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Encoding a body failed.
    #[error("encode: {0}")]
    Encode(String),

    /// Decoding a body failed.
    #[error("decode: {0}")]
    Decode(String),
}

/// Why a request handler did not produce a payload.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// Request body or payload could not be understood.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// Handler returned an error.
    #[error("handler failed: {0}")]
    Internal(String),
}

impl HandlerError {
    /// Stable error code carried on the wire.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Panicked(_) => "HANDLER_PANICKED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<ciborium::de::Error<io::Error>> for CodecError {
    fn from(e: ciborium::de::Error<io::Error>) -> Self {
        Self::Decode(e.to_string())
    }
}

impl From<ciborium::ser::Error<io::Error>> for CodecError {
    fn from(e: ciborium::ser::Error<io::Error>) -> Self {
        Self::Encode(e.to_string())
    }
}
