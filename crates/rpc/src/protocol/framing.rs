//! Message framing for the wire protocol.
//!
//! Every frame starts with a fixed 16 byte big-endian header:
//!
//! ```text
//! +--------+------+-----+------------+----------+------------+
//! | magic  | type | ext | request id | body len |    body    |
//! |  u16   |  u8  | u8  |    u64     |   u32    | body len B |
//! +--------+------+-----+------------+----------+------------+
//! ```

use crate::error::{Error, ProtocolError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::codec::{Decoder, Encoder};

/// Protocol magic, first two bytes of every frame.
pub const MAGIC: u16 = 0xCECE;

/// Maximum body size (10MB by default).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Frame header size (2 magic + 1 type + 1 ext + 8 request id + 4 body length).
pub const FRAME_HEADER_SIZE: usize = 16;

/// Kind of message a frame carries.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Liveness check from a client.
    HeartbeatRequest = 0x01,
    /// Reply to a liveness check.
    HeartbeatResponse = 0x02,
    /// Application request.
    #[default]
    MessageRequest = 0x03,
    /// Application response.
    MessageResponse = 0x04,
}

impl MessageType {
    /// Whether this type travels from client to server.
    #[must_use]
    pub const fn is_request(self) -> bool {
        matches!(self, Self::HeartbeatRequest | Self::MessageRequest)
    }

    /// The type a server answers this request type with.
    #[must_use]
    pub const fn response_type(self) -> Self {
        match self {
            Self::HeartbeatRequest | Self::HeartbeatResponse => Self::HeartbeatResponse,
            Self::MessageRequest | Self::MessageResponse => Self::MessageResponse,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(Self::HeartbeatRequest),
            0x02 => Ok(Self::HeartbeatResponse),
            0x03 => Ok(Self::MessageRequest),
            0x04 => Ok(Self::MessageResponse),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::HeartbeatRequest => "HEARTBEAT_REQ",
            Self::HeartbeatResponse => "HEARTBEAT_RESP",
            Self::MessageRequest => "MESSAGE_REQ",
            Self::MessageResponse => "MESSAGE_RESP",
        };
        f.write_str(name)
    }
}

/// A frame in the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Type of this frame.
    pub message_type: MessageType,
    /// Correlates a response with its request.
    pub request_id: u64,
    /// Serialized body, opaque to the framing layer.
    pub body: Bytes,
}

impl Frame {
    /// Create a new frame.
    #[must_use]
    pub const fn new(message_type: MessageType, request_id: u64, body: Bytes) -> Self {
        Self {
            message_type,
            request_id,
            body,
        }
    }

    /// Heartbeat request. Heartbeats carry no body.
    #[must_use]
    pub const fn heartbeat_request(request_id: u64) -> Self {
        Self::new(MessageType::HeartbeatRequest, request_id, Bytes::new())
    }

    /// Heartbeat reply echoing the request id.
    #[must_use]
    pub const fn heartbeat_response(request_id: u64) -> Self {
        Self::new(MessageType::HeartbeatResponse, request_id, Bytes::new())
    }

    /// Whether this is a heartbeat in either direction.
    #[must_use]
    pub const fn is_heartbeat(&self) -> bool {
        matches!(
            self.message_type,
            MessageType::HeartbeatRequest | MessageType::HeartbeatResponse
        )
    }
}

/// Codec for encoding/decoding frames.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolCodec {
    max_frame_size: usize,
}

impl ProtocolCodec {
    /// Create a new protocol codec.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with custom max body size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    fn check_size(&self, size: usize) -> std::result::Result<(), ProtocolError> {
        if size > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }
}

impl Default for ProtocolCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ProtocolCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> std::result::Result<Option<Self::Item>, Error> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Parse header without consuming
        let mut header = &buf[..FRAME_HEADER_SIZE];
        let magic = header.get_u16();
        let type_byte = header.get_u8();
        let ext = header.get_u8();
        let request_id = header.get_u64();
        let body_len = header.get_u32() as usize;

        if magic != MAGIC {
            return Err(ProtocolError::BadMagic(magic).into());
        }
        let message_type = MessageType::try_from(type_byte)?;
        if ext != 0 {
            return Err(ProtocolError::ReservedExtension(ext).into());
        }
        self.check_size(body_len)?;

        let frame_len = FRAME_HEADER_SIZE + body_len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let body = buf.split_to(body_len).freeze();

        Ok(Some(Frame {
            message_type,
            request_id,
            body,
        }))
    }
}

impl Encoder<Frame> for ProtocolCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, buf: &mut BytesMut) -> std::result::Result<(), Error> {
        let body_len = frame.body.len();
        self.check_size(body_len)?;

        buf.reserve(FRAME_HEADER_SIZE + body_len);

        buf.put_u16(MAGIC);
        buf.put_u8(frame.message_type as u8);
        buf.put_u8(0);
        buf.put_u64(frame.request_id);
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(body_len as u32);
        buf.put(frame.body);

        Ok(())
    }
}
