//! Error types for the router.

use relay_coordination::{CoordinationError, CoordinationErrorKind};
use thiserror::Error;

/// Router errors.
#[derive(Debug, Error)]
pub enum Error {
    /// No factory is registered under the configured strategy name.
    #[error("Unknown route strategy: {0}")]
    UnknownRouteStrategy(String),

    /// `start` was called on a running router.
    #[error("Router already started")]
    AlreadyStarted,

    /// An event could not be encoded or decoded.
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// A stored rule could not be encoded or decoded.
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    /// Metrics could not be encoded for publication.
    #[error("Invalid metrics: {0}")]
    InvalidMetrics(String),

    /// Transport failure.
    #[error(transparent)]
    Rpc(#[from] relay_rpc::Error),

    /// Membership failure.
    #[error(transparent)]
    Membership(#[from] relay_membership::Error),

    /// The coordination service failed while loading rules or publishing metrics.
    #[error("Coordination error ({kind:?}): {message}")]
    Coordination {
        /// Category of the underlying failure.
        kind: CoordinationErrorKind,
        /// Underlying error message.
        message: String,
    },
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

/// Result alias for router operations.
pub type Result<T> = std::result::Result<T, Error>;
