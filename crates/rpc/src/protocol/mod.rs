//! Protocol layer for the RPC framework.
//!
//! This module contains the core protocol definitions including:
//! - Wire framing and the frame codec
//! - Request and response messages
//! - Pluggable body serialization

pub mod codec;
pub mod framing;
pub mod message;

pub use codec::BodyFormat;
pub use framing::{FRAME_HEADER_SIZE, Frame, MAGIC, MAX_FRAME_SIZE, MessageType, ProtocolCodec};
pub use message::{RemoteError, Request, Response};
