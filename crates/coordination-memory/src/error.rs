use relay_coordination::{CoordinationError, CoordinationErrorKind};
use thiserror::Error;

/// Errors from the in-memory coordinator.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The path is not absolute or has empty segments.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// An entry already exists at the path.
    #[error("entry already exists: {0}")]
    NodeExists(String),

    /// No entry exists at the path.
    #[error("no entry at {0}")]
    NoNode(String),

    /// The session was expired and can no longer be used.
    #[error("session {0} expired")]
    SessionExpired(u64),
}

impl CoordinationError for Error {
    fn kind(&self) -> CoordinationErrorKind {
        match self {
            Self::NodeExists(_) => CoordinationErrorKind::NodeExists,
            Self::NoNode(_) => CoordinationErrorKind::NoNode,
            Self::SessionExpired(_) => CoordinationErrorKind::SessionExpired,
            Self::InvalidPath(_) => CoordinationErrorKind::Other,
        }
    }
}
