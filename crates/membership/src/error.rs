//! Error types for cluster membership.

use relay_coordination::{CoordinationError, CoordinationErrorKind};
use thiserror::Error;

/// Membership errors.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The coordination service failed.
    #[error("Coordination error ({kind:?}): {message}")]
    Coordination {
        /// Category of the underlying failure.
        kind: CoordinationErrorKind,
        /// Underlying error message.
        message: String,
    },

    /// A node entry could not be encoded or decoded.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// `start` was called twice.
    #[error("Membership already started")]
    AlreadyStarted,
}

impl Error {
    /// Wrap a coordination-service error.
    #[must_use]
    #[allow(clippy::needless_pass_by_value)]
    pub fn coordination<E: CoordinationError>(error: E) -> Self {
        Self::Coordination {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Result alias for membership operations.
pub type Result<T> = std::result::Result<T, Error>;
