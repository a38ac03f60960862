//! Abstract interface to a hierarchical coordination service.
//!
//! Entries live at slash-separated paths and carry opaque data. Ephemeral
//! entries belong to the session that created them and vanish with it.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod paths;

pub use paths::{ClusterPaths, DEFAULT_ROOT, child_name, join, parent};

use std::error::Error;
use std::fmt::Debug;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

/// Broad category of a coordination failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordinationErrorKind {
    /// The entry already exists.
    NodeExists,
    /// The entry or its parent does not exist.
    NoNode,
    /// The connection to the service was lost.
    ConnectionLoss,
    /// The session expired; its ephemeral entries are gone.
    SessionExpired,
    /// Anything else.
    Other,
}

/// Marker trait for `CoordinationClient` errors
pub trait CoordinationError: Debug + Error + Send + Sync + 'static {
    /// Category of this error.
    fn kind(&self) -> CoordinationErrorKind;
}

/// A direct child of a watched entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildData {
    /// Full path of the child.
    pub path: String,
    /// Last path segment.
    pub name: String,
    /// Data stored at the child.
    pub data: Bytes,
}

/// Change notification for the children of a watched entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    /// A child was created.
    ChildAdded(ChildData),
    /// A child's data changed.
    ChildUpdated(ChildData),
    /// A child was deleted.
    ChildRemoved(ChildData),
    /// The connection came back after a suspension.
    Reconnected,
    /// The connection was interrupted; the view may be stale.
    Suspended,
}

/// Stream of watch events. Ends when the session closes.
pub type WatchStream = Pin<Box<dyn Stream<Item = WatchEvent> + Send>>;

/// A session with the coordination service.
#[async_trait]
pub trait CoordinationClient: Clone + Send + Sync + 'static {
    /// The error type for coordination operations.
    type Error: CoordinationError;

    /// Create a persistent entry, creating missing parents. Succeeds if the
    /// entry already exists.
    async fn create_persistent(&self, path: &str, data: Bytes) -> Result<(), Self::Error>;

    /// Create an entry owned by this session, creating missing parents.
    ///
    /// Fails with [`CoordinationErrorKind::NodeExists`] if the entry exists.
    async fn create_ephemeral(&self, path: &str, data: Bytes) -> Result<(), Self::Error>;

    /// Replace the data of an existing entry.
    async fn set_data(&self, path: &str, data: Bytes) -> Result<(), Self::Error>;

    /// Delete an entry and everything under it. A missing entry is not an error.
    async fn delete(&self, path: &str) -> Result<(), Self::Error>;

    /// Whether an entry exists.
    async fn exists(&self, path: &str) -> Result<bool, Self::Error>;

    /// Data of an entry, or `None` if it does not exist.
    async fn get_data(&self, path: &str) -> Result<Option<Bytes>, Self::Error>;

    /// Direct children of an entry, ordered by name.
    async fn get_children(&self, path: &str) -> Result<Vec<ChildData>, Self::Error>;

    /// Watch the direct children of an entry.
    ///
    /// Only changes made after the call are reported; pair with
    /// [`get_children`](Self::get_children) for the initial state.
    async fn watch_children(&self, path: &str) -> Result<WatchStream, Self::Error>;
}
