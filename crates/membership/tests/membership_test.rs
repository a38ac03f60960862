use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use relay_coordination::CoordinationClient;
use relay_coordination_memory::{MemoryCoordinator, MemorySession};
use relay_membership::{
    ClusterMembership, Error, ListenerError, MembershipConfig, MembershipSnapshot, Node,
};

fn config() -> MembershipConfig {
    MembershipConfig::default()
}

fn member(coordinator: &MemoryCoordinator, port: u16) -> (MemorySession, ClusterMembership<MemorySession>) {
    let session = coordinator.session();
    let membership = ClusterMembership::new(
        session.clone(),
        &config(),
        Node::local("cluster1", "127.0.0.1", port),
    );
    (session, membership)
}

async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_members_see_each_other() {
    let coordinator = MemoryCoordinator::new();
    let (_sa, a) = member(&coordinator, 9001);
    let (_sb, b) = member(&coordinator, 9002);

    a.start().await.unwrap();
    b.start().await.unwrap();

    assert!(eventually(|| a.nodes().len() == 2).await);
    assert_eq!(b.nodes().len(), 2);

    let view = a.nodes();
    assert_eq!(view.local(), Some(a.local_node()));
    assert_eq!(view.nodes().iter().filter(|n| n.is_local).count(), 1);
    assert!(a.is_local(&Node::new("cluster1", "127.0.0.1", 9001)));
    assert!(!a.is_local(&Node::new("cluster1", "127.0.0.1", 9002)));
    assert!(coordinator.contains("/relay/cluster1/node/127.0.0.1:9002"));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_departure_is_observed() {
    let coordinator = MemoryCoordinator::new();
    let (_sa, a) = member(&coordinator, 9001);
    let (sb, b) = member(&coordinator, 9002);
    a.start().await.unwrap();
    b.start().await.unwrap();
    assert!(eventually(|| a.nodes().len() == 2).await);

    sb.expire();

    assert!(eventually(|| a.nodes().len() == 1).await);
    assert!(a.nodes().local().is_some());

    a.stop().await;
}

#[tokio::test]
async fn test_listeners_get_full_set_and_are_isolated() {
    let coordinator = MemoryCoordinator::new();
    let (_sa, a) = member(&coordinator, 9001);
    a.start().await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::<usize>::new()));
    let calls = Arc::new(AtomicUsize::new(0));

    a.subscribe(|_: &MembershipSnapshot| -> Result<(), ListenerError> {
        Err("listener refuses".into())
    });
    a.subscribe(|_: &MembershipSnapshot| -> Result<(), ListenerError> {
        panic!("listener explodes")
    });
    let sink = Arc::clone(&seen);
    a.subscribe(move |snapshot: &MembershipSnapshot| -> Result<(), ListenerError> {
        sink.lock().push(snapshot.len());
        Ok(())
    });
    let counter = Arc::clone(&calls);
    let removed = a.subscribe(move |_: &MembershipSnapshot| -> Result<(), ListenerError> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    assert!(a.unsubscribe(removed));
    assert!(!a.unsubscribe(removed));

    let (_sb, b) = member(&coordinator, 9002);
    b.start().await.unwrap();

    assert!(eventually(|| seen.lock().last() == Some(&2)).await);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    a.stop().await;
    b.stop().await;
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_reregisters_after_session_loss() {
    let coordinator = MemoryCoordinator::new();
    let (session, a) = member(&coordinator, 9001);
    a.start().await.unwrap();
    let entry = "/relay/cluster1/node/127.0.0.1:9001";

    session.simulate_session_loss();

    assert!(eventually(|| coordinator.contains(entry)).await);
    assert!(eventually(|| a.nodes().len() == 1).await);

    a.stop().await;
}

#[tokio::test]
async fn test_reregisters_when_entry_disappears() {
    let coordinator = MemoryCoordinator::new();
    let (_sa, a) = member(&coordinator, 9001);
    a.start().await.unwrap();

    // Someone else removes our entry
    let other = coordinator.session();
    other
        .delete("/relay/cluster1/node/127.0.0.1:9001")
        .await
        .unwrap();

    assert!(eventually(|| coordinator.contains("/relay/cluster1/node/127.0.0.1:9001")).await);

    a.stop().await;
}

#[tokio::test]
async fn test_unregister_is_not_undone() {
    let coordinator = MemoryCoordinator::new();
    let (_sa, a) = member(&coordinator, 9001);
    let (_sb, b) = member(&coordinator, 9002);
    a.start().await.unwrap();
    b.start().await.unwrap();

    a.unregister().await.unwrap();

    assert!(eventually(|| b.nodes().len() == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!coordinator.contains("/relay/cluster1/node/127.0.0.1:9001"));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_undecodable_entries_are_skipped() {
    let coordinator = MemoryCoordinator::new();
    let writer = coordinator.session();
    writer
        .create_persistent("/relay/cluster1/node/garbage", Bytes::from_static(b"{oops"))
        .await
        .unwrap();

    let (_sa, a) = member(&coordinator, 9001);
    a.start().await.unwrap();

    assert_eq!(a.nodes().endpoints(), vec!["127.0.0.1:9001".to_string()]);

    a.stop().await;
}

#[tokio::test]
async fn test_start_twice_fails_and_stop_is_idempotent() {
    let coordinator = MemoryCoordinator::new();
    let (_sa, a) = member(&coordinator, 9001);

    a.start().await.unwrap();
    assert!(matches!(a.start().await, Err(Error::AlreadyStarted)));
    assert!(a.is_running());

    a.stop().await;
    a.stop().await;
    assert!(!a.is_running());
}

#[tokio::test]
async fn test_expired_session_fails_start() {
    let coordinator = MemoryCoordinator::new();
    let (session, a) = member(&coordinator, 9001);
    session.expire();

    assert!(matches!(a.start().await, Err(Error::Coordination { .. })));
    assert!(!a.is_running());
}
