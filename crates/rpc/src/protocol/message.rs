//! Request and response messages carried inside frames.
//!
//! The frame header is authoritative for `request_id` and `message_type`;
//! those fields are not part of the serialized body and are filled back in
//! from the header when a frame is decoded.

use crate::error::{HandlerError, ProtocolError, Result};
use crate::protocol::codec::BodyFormat;
use crate::protocol::framing::{Frame, MessageType};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// A call sent from client to server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Per-client correlation id.
    #[serde(skip)]
    pub request_id: u64,
    /// Frame type this request travels as.
    #[serde(skip)]
    pub message_type: MessageType,
    /// Opaque application payload.
    pub payload: Bytes,
    /// Free-form string metadata.
    pub attachments: HashMap<String, String>,
    /// How long the caller is willing to wait, in milliseconds.
    pub timeout_ms: u64,
}

impl Request {
    /// New message request with the given payload.
    #[must_use]
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_attachment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attachments.insert(key.into(), value.into());
        self
    }

    /// Caller-side timeout carried with the request.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Serialize into a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the body cannot be serialized.
    pub fn to_frame(&self, format: BodyFormat) -> Result<Frame> {
        let body = if self.message_type == MessageType::HeartbeatRequest {
            Bytes::new()
        } else {
            format.encode(self)?
        };
        Ok(Frame::new(self.message_type, self.request_id, body))
    }

    /// Rebuild a request from a decoded frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a request or its body is malformed.
    pub fn from_frame(frame: &Frame, format: BodyFormat) -> Result<Self> {
        if !frame.message_type.is_request() {
            return Err(ProtocolError::UnexpectedMessageType {
                expected: MessageType::MessageRequest.to_string(),
                actual: frame.message_type.to_string(),
            }
            .into());
        }
        let mut request = if frame.is_heartbeat() {
            Self::default()
        } else {
            format.decode::<Self>(&frame.body)?
        };
        request.request_id = frame.request_id;
        request.message_type = frame.message_type;
        Ok(request)
    }
}

/// Error details reported by the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Error code for categorization.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

impl RemoteError {
    /// Create a new remote error.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&HandlerError> for RemoteError {
    fn from(err: &HandlerError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// A reply sent from server to client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request this answers.
    #[serde(skip)]
    pub request_id: u64,
    /// Frame type this response travels as.
    #[serde(skip)]
    pub message_type: MessageType,
    /// Opaque application payload.
    pub payload: Bytes,
    /// Free-form string metadata.
    pub attachments: HashMap<String, String>,
    /// Set when the handler failed. The call itself still succeeded.
    pub error: Option<RemoteError>,
    /// Wall-clock time spent handling the request, in milliseconds.
    pub process_time_ms: u64,
    /// Timeout the request was sent with.
    pub timeout_ms: u64,
}

impl Response {
    /// Successful reply carrying a payload.
    #[must_use]
    pub fn success(request_id: u64, payload: Bytes) -> Self {
        Self {
            request_id,
            message_type: MessageType::MessageResponse,
            payload,
            ..Self::default()
        }
    }

    /// Failed reply carrying error details.
    #[must_use]
    pub fn failure(request_id: u64, error: RemoteError) -> Self {
        Self {
            request_id,
            message_type: MessageType::MessageResponse,
            error: Some(error),
            ..Self::default()
        }
    }

    /// Whether the remote handler succeeded.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Serialize into a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the body cannot be serialized.
    pub fn to_frame(&self, format: BodyFormat) -> Result<Frame> {
        Ok(Frame::new(
            MessageType::MessageResponse,
            self.request_id,
            format.encode(self)?,
        ))
    }

    /// Rebuild a response from a decoded frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a message response or its body is malformed.
    pub fn from_frame(frame: &Frame, format: BodyFormat) -> Result<Self> {
        if frame.message_type != MessageType::MessageResponse {
            return Err(ProtocolError::UnexpectedMessageType {
                expected: MessageType::MessageResponse.to_string(),
                actual: frame.message_type.to_string(),
            }
            .into());
        }
        let mut response = format.decode::<Self>(&frame.body)?;
        response.request_id = frame.request_id;
        response.message_type = frame.message_type;
        Ok(response)
    }
}
