//! Consistent hash ring with virtual nodes.
//!
//! Each node is placed on a 32-bit ring at `replicas` positions derived from
//! its display string. A key maps to the first position at or after its own
//! hash, wrapping to the start of the ring, so adding or removing one of N
//! nodes only moves about 1/N of the keys.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::BTreeMap;
use std::fmt::Display;

/// Virtual nodes placed per real node unless configured otherwise.
pub const DEFAULT_REPLICAS: usize = 1000;

/// Ring position of `key`: the first four bytes of its MD5 digest, big-endian.
#[must_use]
pub fn hash(key: &str) -> u32 {
    let [a, b, c, d, ..] = md5::compute(key.as_bytes()).0;
    u32::from_be_bytes([a, b, c, d])
}

/// A consistent hash ring over nodes identified by their `Display` output.
#[derive(Debug, Clone)]
pub struct ConsistentHash<T> {
    replicas: usize,
    circle: BTreeMap<u32, T>,
}

impl<T> Default for ConsistentHash<T>
where
    T: Display + Clone,
{
    fn default() -> Self {
        Self::new(DEFAULT_REPLICAS)
    }
}

impl<T> ConsistentHash<T>
where
    T: Display + Clone,
{
    /// Empty ring placing `replicas` virtual nodes per node.
    #[must_use]
    pub const fn new(replicas: usize) -> Self {
        Self {
            replicas,
            circle: BTreeMap::new(),
        }
    }

    /// Ring populated with `nodes`.
    pub fn with_nodes<I>(replicas: usize, nodes: I) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        let mut ring = Self::new(replicas);
        ring.add_all(nodes);
        ring
    }

    /// Virtual nodes per node.
    #[must_use]
    pub const fn replicas(&self) -> usize {
        self.replicas
    }

    /// Place `node` on the ring.
    ///
    /// When two virtual nodes collide the one added last owns the position.
    pub fn add(&mut self, node: T) {
        for position in self.positions(&node) {
            self.circle.insert(position, node.clone());
        }
    }

    /// Place every node from `nodes`.
    pub fn add_all<I>(&mut self, nodes: I)
    where
        I: IntoIterator<Item = T>,
    {
        for node in nodes {
            self.add(node);
        }
    }

    /// Take `node`'s positions off the ring.
    ///
    /// A position another node took over through a collision stays with
    /// that node.
    pub fn remove(&mut self, node: &T) {
        let name = node.to_string();
        for position in self.positions(node) {
            if self.owned_by(position, &name) {
                self.circle.remove(&position);
            }
        }
    }

    /// Whether `node` owns any position on the ring.
    #[must_use]
    pub fn contains(&self, node: &T) -> bool {
        let name = node.to_string();
        self.positions(node)
            .into_iter()
            .any(|position| self.owned_by(position, &name))
    }

    /// Remove every node.
    pub fn clear(&mut self) {
        self.circle.clear();
    }

    /// Node owning `key`, or `None` when the ring is empty.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&T> {
        let position = hash(key);
        self.circle
            .range(position..)
            .next()
            .or_else(|| self.circle.iter().next())
            .map(|(_, node)| node)
    }

    /// Number of occupied positions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.circle.len()
    }

    /// Whether the ring has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.circle.is_empty()
    }

    /// Distinct nodes on the ring, ordered by display string.
    #[must_use]
    pub fn nodes(&self) -> Vec<T> {
        let mut seen = BTreeMap::new();
        for node in self.circle.values() {
            seen.entry(node.to_string()).or_insert_with(|| node.clone());
        }
        seen.into_values().collect()
    }

    fn owned_by(&self, position: u32, name: &str) -> bool {
        self.circle
            .get(&position)
            .is_some_and(|owner| owner.to_string() == name)
    }

    fn positions(&self, node: &T) -> Vec<u32> {
        let name = node.to_string();
        (0..self.replicas)
            .map(|i| hash(&format!("{name}{i}")))
            .collect()
    }
}
