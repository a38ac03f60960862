//! Cluster node identity.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A routing endpoint in the cluster.
///
/// Two nodes are the same node when their host and port match; the cluster
/// id and the local flag do not take part in equality, ordering or hashing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    /// Cluster the node belongs to.
    pub cluster_id: String,
    /// Host the node's RPC server listens on.
    pub host: String,
    /// Port the node's RPC server listens on.
    pub port: u16,
    /// Whether this is the node of the current process. Never serialized.
    #[serde(skip)]
    pub is_local: bool,
}

impl Node {
    /// A remote node.
    #[must_use]
    pub fn new(cluster_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            host: host.into(),
            port,
            is_local: false,
        }
    }

    /// The node of the current process.
    #[must_use]
    pub fn local(cluster_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            is_local: true,
            ..Self::new(cluster_id, host, port)
        }
    }

    /// Identifier used as the coordination entry name: `host:port`.
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Serialize as the JSON value stored in the coordination entry.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::Encoding(e.to_string()))
    }

    /// Parse a coordination entry value. The result is never local.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is not a JSON node.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::Encoding(e.to_string()))
    }

    fn key(&self) -> (&str, u16) {
        (&self.host, self.port)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_identity_is_host_and_port() {
        let a = Node::local("c1", "10.0.0.1", 8404);
        let b = Node::new("other", "10.0.0.1", 8404);
        let c = Node::new("c1", "10.0.0.1", 8405);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a < c);

        let set: HashSet<Node> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_json_never_carries_local_flag() {
        let node = Node::local("c1", "127.0.0.1", 8404);
        let json = node.to_json().unwrap();

        let text = std::str::from_utf8(&json).unwrap();
        assert!(!text.contains("is_local"));

        let parsed = Node::from_json(&json).unwrap();
        assert_eq!(parsed, node);
        assert!(!parsed.is_local);
        assert_eq!(parsed.cluster_id, "c1");
    }

    #[test]
    fn test_id_matches_display() {
        let node = Node::new("c1", "127.0.0.1", 8404);
        assert_eq!(node.id(), "127.0.0.1:8404");
        assert_eq!(node.to_string(), node.id());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(Node::from_json(b"not json").is_err());
    }
}
