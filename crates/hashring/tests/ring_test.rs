use proptest::prelude::*;
use relay_hashring::ConsistentHash;
use std::collections::HashMap;

fn endpoints(n: u16) -> Vec<String> {
    (0..n).map(|i| format!("10.0.0.{i}:8404")).collect()
}

fn owners(ring: &ConsistentHash<String>, keys: usize) -> Vec<String> {
    (0..keys)
        .map(|i| ring.get(&format!("key-{i}")).cloned().unwrap())
        .collect()
}

#[test]
fn test_distribution_is_roughly_even() {
    let ring = ConsistentHash::with_nodes(1000, endpoints(4));
    let mut counts: HashMap<String, usize> = HashMap::new();
    for owner in owners(&ring, 20_000) {
        *counts.entry(owner).or_default() += 1;
    }

    assert_eq!(counts.len(), 4);
    for (node, count) in counts {
        // 5000 expected per node
        assert!((3500..6500).contains(&count), "{node} got {count}");
    }
}

#[test]
fn test_removing_one_node_moves_about_one_nth() {
    let nodes = endpoints(5);
    let mut ring = ConsistentHash::with_nodes(1000, nodes.clone());
    let before = owners(&ring, 10_000);

    ring.remove(&nodes[2]);
    let after = owners(&ring, 10_000);

    let moved = before.iter().zip(&after).filter(|(a, b)| a != b).count();
    // Only keys owned by the removed node move: 1/5 of 10000, +/- 20%
    assert!((1600..=2400).contains(&moved), "moved {moved}");
    for (old, new) in before.iter().zip(&after) {
        if old != new {
            assert_eq!(old, &nodes[2]);
        }
    }
}

#[test]
fn test_adding_one_node_moves_about_one_nth() {
    let mut nodes = endpoints(4);
    let mut ring = ConsistentHash::with_nodes(1000, nodes.clone());
    let before = owners(&ring, 10_000);

    nodes.push("10.0.0.99:8404".to_string());
    ring.add(nodes[4].clone());
    let after = owners(&ring, 10_000);

    let moved: Vec<_> = before
        .iter()
        .zip(&after)
        .filter(|(a, b)| a != b)
        .map(|(_, b)| b)
        .collect();
    assert!((1600..=2400).contains(&moved.len()), "moved {}", moved.len());
    assert!(moved.iter().all(|owner| *owner == &nodes[4]));
}

proptest! {
    #[test]
    fn prop_lookup_is_deterministic(key in ".*", n in 1u16..8) {
        let a = ConsistentHash::with_nodes(50, endpoints(n));
        let b = ConsistentHash::with_nodes(50, endpoints(n).into_iter().rev());
        prop_assert_eq!(a.get(&key), b.get(&key));
    }

    #[test]
    fn prop_nonempty_ring_always_answers(key in ".*", n in 1u16..8) {
        let ring = ConsistentHash::with_nodes(20, endpoints(n));
        let owner = ring.get(&key).cloned();
        prop_assert!(owner.is_some_and(|owner| endpoints(n).contains(&owner)));
    }
}
