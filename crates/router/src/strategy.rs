//! Choosing the node an event is delivered to.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use relay_hashring::ConsistentHash;
use relay_membership::Node;
use tracing::{debug, warn};

use crate::config::RouterConfig;
use crate::error::{Error, Result};
use crate::event::Event;

/// Picks a target node for an event out of the current membership.
pub trait RouteStrategy: Send + Sync {
    /// Name the strategy is registered under.
    fn name(&self) -> &str;

    /// Target node for `event`, or `None` when no node fits.
    fn route(&self, event: &Event, nodes: &[Node]) -> Option<Node>;
}

struct Ring {
    /// Sorted, without duplicates.
    members: Vec<Node>,
    hash: ConsistentHash<Node>,
}

impl Ring {
    fn build(replicas: usize, nodes: &[Node]) -> Self {
        let mut members = nodes.to_vec();
        members.sort();
        members.dedup();
        let hash = ConsistentHash::with_nodes(replicas, members.iter().cloned());
        Self { members, hash }
    }

    fn matches(&self, nodes: &[Node]) -> bool {
        // Membership snapshots arrive sorted, so this is the usual hit
        if self.members.as_slice() == nodes {
            return true;
        }
        nodes.len() >= self.members.len()
            && nodes
                .iter()
                .all(|node| self.members.binary_search(node).is_ok())
            && self.members.iter().all(|member| nodes.contains(member))
    }
}

/// Affinity routing over a consistent hash ring.
///
/// The ring is rebuilt only when the node set passed to [`route`](RouteStrategy::route)
/// differs from the one it was last built from. Lookups against an unchanged
/// set share the current ring without locking.
pub struct HashRouteStrategy {
    replicas: usize,
    ring: ArcSwap<Ring>,
    rebuild: Mutex<()>,
    rebuilds: AtomicU64,
}

impl HashRouteStrategy {
    /// Strategy placing `replicas` virtual nodes per node.
    #[must_use]
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas,
            ring: ArcSwap::from_pointee(Ring {
                members: Vec::new(),
                hash: ConsistentHash::new(replicas),
            }),
            rebuild: Mutex::new(()),
            rebuilds: AtomicU64::new(0),
        }
    }

    /// Virtual nodes per node.
    #[must_use]
    pub const fn replicas(&self) -> usize {
        self.replicas
    }

    /// How many times the ring has been rebuilt.
    #[must_use]
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds.load(Ordering::Relaxed)
    }

    fn ring_for(&self, nodes: &[Node]) -> Arc<Ring> {
        let current = self.ring.load_full();
        if current.matches(nodes) {
            return current;
        }

        let _rebuild = self.rebuild.lock();
        // Another caller may have rebuilt for the same set while we waited
        let current = self.ring.load_full();
        if current.matches(nodes) {
            return current;
        }

        let ring = Arc::new(Ring::build(self.replicas, nodes));
        debug!("Rebuilt hash ring for {} nodes", ring.members.len());
        self.ring.store(Arc::clone(&ring));
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
        ring
    }
}

impl RouteStrategy for HashRouteStrategy {
    fn name(&self) -> &str {
        "hash"
    }

    fn route(&self, event: &Event, nodes: &[Node]) -> Option<Node> {
        let Some(key) = event.routing_key() else {
            warn!(
                "Event from {} has neither hash tag nor data type, cannot route",
                event.source_name
            );
            return None;
        };

        self.ring_for(nodes).hash.get(key).cloned()
    }
}

/// Always picks the local node.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalRouteStrategy;

impl RouteStrategy for LocalRouteStrategy {
    fn name(&self) -> &str {
        "local"
    }

    fn route(&self, _event: &Event, nodes: &[Node]) -> Option<Node> {
        nodes.iter().find(|node| node.is_local).cloned()
    }
}

/// Builds a strategy from the router configuration.
pub type StrategyFactory = Arc<dyn Fn(&RouterConfig) -> Box<dyn RouteStrategy> + Send + Sync>;

/// Named strategy factories.
///
/// `hash` and `local` are registered by default; other strategies can be
/// added with [`register`](Self::register).
#[derive(Clone)]
pub struct RouteStrategyRegistry {
    factories: HashMap<String, StrategyFactory>,
}

impl Default for RouteStrategyRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("hash", |config: &RouterConfig| {
            Box::new(HashRouteStrategy::new(config.hash_replicas)) as Box<dyn RouteStrategy>
        });
        registry.register("local", |_: &RouterConfig| {
            Box::new(LocalRouteStrategy) as Box<dyn RouteStrategy>
        });
        registry
    }
}

impl RouteStrategyRegistry {
    /// Registry holding the built-in strategies.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&RouterConfig) -> Box<dyn RouteStrategy> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Build the strategy registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownRouteStrategy`] if nothing is registered under `name`.
    pub fn create(&self, name: &str, config: &RouterConfig) -> Result<Box<dyn RouteStrategy>> {
        self.factories
            .get(name)
            .map(|factory| factory(config))
            .ok_or_else(|| Error::UnknownRouteStrategy(name.to_string()))
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(ports: &[u16]) -> Vec<Node> {
        ports
            .iter()
            .map(|port| Node::new("cluster1", "127.0.0.1", *port))
            .collect()
    }

    #[test]
    fn test_hash_is_stable_for_a_key() {
        let strategy = HashRouteStrategy::new(100);
        let nodes = cluster(&[9001, 9002, 9003]);
        let event = Event::new("src", "order").with_hash_tag("user-7");

        let first = strategy.route(&event, &nodes).unwrap();
        for _ in 0..10 {
            assert_eq!(strategy.route(&event, &nodes), Some(first.clone()));
        }
    }

    #[test]
    fn test_hash_ignores_node_order() {
        let strategy = HashRouteStrategy::new(100);
        let nodes = cluster(&[9001, 9002, 9003]);
        let mut reversed = nodes.clone();
        reversed.reverse();

        for i in 0..50 {
            let event = Event::new("src", "t").with_hash_tag(format!("k{i}"));
            assert_eq!(strategy.route(&event, &nodes), strategy.route(&event, &reversed));
        }
    }

    #[test]
    fn test_hash_follows_membership_changes() {
        let strategy = HashRouteStrategy::new(100);
        let event = Event::new("src", "order");

        assert_eq!(
            strategy.route(&event, &cluster(&[9001])),
            Some(Node::new("cluster1", "127.0.0.1", 9001))
        );
        assert_eq!(
            strategy.route(&event, &cluster(&[9002])),
            Some(Node::new("cluster1", "127.0.0.1", 9002))
        );
        assert_eq!(strategy.route(&event, &[]), None);
    }

    #[test]
    fn test_hash_ring_rebuilt_only_on_membership_change() {
        let strategy = HashRouteStrategy::new(100);
        let nodes = cluster(&[9001, 9002, 9003]);
        let mut shuffled = nodes.clone();
        shuffled.swap(0, 2);
        shuffled.push(nodes[1].clone());

        for i in 0..20 {
            let event = Event::new("src", "t").with_hash_tag(format!("k{i}"));
            strategy.route(&event, &nodes);
            strategy.route(&event, &shuffled);
        }
        assert_eq!(strategy.rebuilds(), 1);

        let event = Event::new("src", "t");
        strategy.route(&event, &cluster(&[9001, 9002]));
        assert_eq!(strategy.rebuilds(), 2);
        // Same size, different members
        strategy.route(&event, &cluster(&[9001, 9004]));
        assert_eq!(strategy.rebuilds(), 3);
        strategy.route(&event, &[]);
        assert_eq!(strategy.rebuilds(), 4);
    }

    #[test]
    fn test_hash_concurrent_lookups_agree() {
        let strategy = Arc::new(HashRouteStrategy::new(100));
        let nodes = Arc::new(cluster(&[9001, 9002, 9003]));
        let event = Event::new("src", "t").with_hash_tag("user-1");
        let expected = strategy.route(&event, &nodes);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let strategy = Arc::clone(&strategy);
                let nodes = Arc::clone(&nodes);
                let event = event.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| strategy.route(&event, &nodes))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap().iter().all(|target| *target == expected));
        }
        assert_eq!(strategy.rebuilds(), 1);
    }

    #[tracing_test::traced_test]
    #[test]
    fn test_hash_without_key() {
        let strategy = HashRouteStrategy::new(100);
        assert_eq!(strategy.route(&Event::new("src", ""), &cluster(&[9001])), None);
        assert!(logs_contain("cannot route"));
    }

    #[test]
    fn test_local_picks_flagged_node() {
        let mut nodes = cluster(&[9001, 9002]);
        nodes[1].is_local = true;

        let target = LocalRouteStrategy.route(&Event::new("src", "t"), &nodes).unwrap();
        assert_eq!(target.port, 9002);
        assert_eq!(LocalRouteStrategy.route(&Event::new("src", "t"), &cluster(&[9001])), None);
    }

    #[test]
    fn test_registry() {
        let mut registry = RouteStrategyRegistry::new();
        assert_eq!(registry.names(), vec!["hash".to_string(), "local".to_string()]);

        let config = RouterConfig {
            hash_replicas: 7,
            ..RouterConfig::default()
        };
        assert_eq!(registry.create("hash", &config).unwrap().name(), "hash");
        assert!(matches!(
            registry.create("random", &config),
            Err(Error::UnknownRouteStrategy(name)) if name == "random"
        ));

        registry.register("pinned", |_: &RouterConfig| {
            Box::new(LocalRouteStrategy) as Box<dyn RouteStrategy>
        });
        assert_eq!(registry.create("pinned", &config).unwrap().name(), "local");
    }
}
