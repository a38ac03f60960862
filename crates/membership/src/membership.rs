//! Cluster membership backed by ephemeral coordination entries.

use std::collections::BTreeSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use relay_coordination::{ClusterPaths, CoordinationClient, DEFAULT_ROOT, WatchEvent, WatchStream};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Error, Result};
use crate::node::Node;

/// How long `stop` waits for the watch task to finish.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Where membership lives in the coordination service.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// Cluster to join.
    pub cluster_id: String,
    /// Root path under which clusters are laid out.
    pub root: String,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            cluster_id: "cluster1".to_string(),
            root: DEFAULT_ROOT.to_string(),
        }
    }
}

/// Immutable view of the cluster at one point in time.
///
/// Nodes are ordered by `(host, port)`. Once the local node is registered
/// it appears exactly once, flagged local.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MembershipSnapshot {
    nodes: Vec<Node>,
}

impl MembershipSnapshot {
    /// Snapshot of `nodes` plus `local`.
    pub fn new<I>(nodes: I, local: &Node) -> Self
    where
        I: IntoIterator<Item = Node>,
    {
        let mut set: BTreeSet<Node> = nodes
            .into_iter()
            .filter(|node| node != local)
            .map(|mut node| {
                node.is_local = false;
                node
            })
            .collect();

        let mut local = local.clone();
        local.is_local = true;
        set.insert(local);

        Self {
            nodes: set.into_iter().collect(),
        }
    }

    /// Every node, local included.
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the snapshot has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether `node` is a member.
    #[must_use]
    pub fn contains(&self, node: &Node) -> bool {
        self.nodes.binary_search(node).is_ok()
    }

    /// The local node, if present.
    #[must_use]
    pub fn local(&self) -> Option<&Node> {
        self.nodes.iter().find(|node| node.is_local)
    }

    /// `host:port` of every node.
    #[must_use]
    pub fn endpoints(&self) -> Vec<String> {
        self.nodes.iter().map(Node::id).collect()
    }
}

/// Opaque handle returned by [`ClusterMembership::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Error a listener may report. It is logged and otherwise ignored.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Receives the full node set after every membership change.
pub trait MembershipListener: Send + Sync + 'static {
    /// Called synchronously on the membership task.
    ///
    /// # Errors
    ///
    /// Errors are logged; they affect neither other listeners nor membership.
    fn on_change(&self, snapshot: &MembershipSnapshot) -> std::result::Result<(), ListenerError>;
}

impl<F> MembershipListener for F
where
    F: Fn(&MembershipSnapshot) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
{
    fn on_change(&self, snapshot: &MembershipSnapshot) -> std::result::Result<(), ListenerError> {
        self(snapshot)
    }
}

type Listeners = RwLock<Vec<(SubscriptionId, Arc<dyn MembershipListener>)>>;

/// State shared with the watch task.
struct Shared<C> {
    client: C,
    paths: ClusterPaths,
    local: Node,
    snapshot: ArcSwap<MembershipSnapshot>,
    listeners: Listeners,
    registered: AtomicBool,
}

impl<C> Shared<C>
where
    C: CoordinationClient,
{
    async fn register(&self) -> Result<()> {
        self.client
            .create_persistent(&self.paths.node(), Bytes::new())
            .await
            .map_err(Error::coordination)?;

        // A stale entry from a previous session may still be present
        let entry = self.paths.node_entry(&self.local.id());
        self.client.delete(&entry).await.map_err(Error::coordination)?;
        self.client
            .create_ephemeral(&entry, self.local.to_json()?)
            .await
            .map_err(Error::coordination)?;

        self.registered.store(true, Ordering::Release);
        info!("Registered node {} at {}", self.local, entry);
        Ok(())
    }

    async fn refresh(&self) -> Result<Arc<MembershipSnapshot>> {
        let children = self
            .client
            .get_children(&self.paths.node())
            .await
            .map_err(Error::coordination)?;

        let local_id = self.local.id();
        if self.registered.load(Ordering::Acquire) && !children.iter().any(|c| c.name == local_id) {
            warn!("Local node {} missing from membership, re-registering", local_id);
            self.register().await?;
        }

        let nodes = children
            .iter()
            .filter_map(|child| match Node::from_json(&child.data) {
                Ok(node) => Some(node),
                Err(e) => {
                    warn!("Skipping undecodable node entry {}: {}", child.path, e);
                    None
                }
            })
            .collect::<Vec<_>>();

        let snapshot = Arc::new(MembershipSnapshot::new(nodes, &self.local));
        self.snapshot.store(Arc::clone(&snapshot));
        debug!("Membership snapshot: {:?}", snapshot.endpoints());
        Ok(snapshot)
    }

    fn notify(&self, snapshot: &MembershipSnapshot) {
        let listeners: Vec<_> = self
            .listeners
            .read()
            .iter()
            .map(|(id, listener)| (*id, Arc::clone(listener)))
            .collect();

        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.on_change(snapshot))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Membership listener {:?} failed: {}", id, e),
                Err(_) => error!("Membership listener {:?} panicked", id),
            }
        }
    }
}

struct WatchTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Tracks the live nodes of one cluster and keeps the local node registered.
pub struct ClusterMembership<C>
where
    C: CoordinationClient,
{
    shared: Arc<Shared<C>>,
    started: AtomicBool,
    next_subscription: AtomicU64,
    task: Mutex<Option<WatchTask>>,
}

impl<C> ClusterMembership<C>
where
    C: CoordinationClient,
{
    /// Membership for `local` in the cluster described by `config`.
    pub fn new(client: C, config: &MembershipConfig, mut local: Node) -> Self {
        local.is_local = true;

        Self {
            shared: Arc::new(Shared {
                client,
                paths: ClusterPaths::new(config.root.clone(), config.cluster_id.clone()),
                local,
                snapshot: ArcSwap::from_pointee(MembershipSnapshot::default()),
                listeners: RwLock::new(Vec::new()),
                registered: AtomicBool::new(false),
            }),
            started: AtomicBool::new(false),
            next_subscription: AtomicU64::new(0),
            task: Mutex::new(None),
        }
    }

    /// Register the local node, load the current members and start watching.
    ///
    /// # Errors
    ///
    /// Returns an error if already started or if the coordination service fails.
    #[instrument(skip(self), fields(node = %self.shared.local))]
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStarted);
        }

        match self.open_watch().await {
            Ok((events, snapshot)) => {
                info!(
                    "Joined cluster {} with {} nodes",
                    self.shared.paths.cluster_id(),
                    snapshot.len()
                );
                self.shared.notify(&snapshot);

                let cancel = CancellationToken::new();
                let handle = tokio::spawn(watch_loop(
                    Arc::clone(&self.shared),
                    events,
                    cancel.clone(),
                ));
                *self.task.lock() = Some(WatchTask { cancel, handle });
                Ok(())
            }
            Err(e) => {
                self.started.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    async fn open_watch(&self) -> Result<(WatchStream, Arc<MembershipSnapshot>)> {
        self.shared.register().await?;
        let events = self
            .shared
            .client
            .watch_children(&self.shared.paths.node())
            .await
            .map_err(Error::coordination)?;
        let snapshot = self.shared.refresh().await?;
        Ok((events, snapshot))
    }

    /// Stop watching and drop every listener. The local entry stays until
    /// [`unregister`](Self::unregister) or the session ends.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(WatchTask { cancel, handle }) = task {
            info!("Stopping membership for node {}", self.shared.local);
            cancel.cancel();
            match tokio::time::timeout(STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!("Membership watch task completed"),
                Ok(Err(e)) => warn!("Membership watch task failed: {}", e),
                Err(_) => warn!("Membership watch task timed out"),
            }
        }
        self.shared.listeners.write().clear();
        self.started.store(false, Ordering::Release);
    }

    /// Delete the local entry and stop re-registering it.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordination service fails.
    pub async fn unregister(&self) -> Result<()> {
        self.shared.registered.store(false, Ordering::Release);
        let entry = self.shared.paths.node_entry(&self.shared.local.id());
        self.shared
            .client
            .delete(&entry)
            .await
            .map_err(Error::coordination)?;
        info!("Unregistered node {}", self.shared.local);
        Ok(())
    }

    /// Rebuild the snapshot now and notify listeners.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordination service fails.
    pub async fn refresh(&self) -> Result<Arc<MembershipSnapshot>> {
        let snapshot = self.shared.refresh().await?;
        self.shared.notify(&snapshot);
        Ok(snapshot)
    }

    /// Call `listener` with the full node set after every change.
    pub fn subscribe<L>(&self, listener: L) -> SubscriptionId
    where
        L: MembershipListener,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let listener: Arc<dyn MembershipListener> = Arc::new(listener);
        self.shared.listeners.write().push((id, listener));
        id
    }

    /// Remove a listener. Returns whether it was subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.shared.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Current snapshot.
    #[must_use]
    pub fn nodes(&self) -> Arc<MembershipSnapshot> {
        self.shared.snapshot.load_full()
    }

    /// The node of this process.
    #[must_use]
    pub fn local_node(&self) -> &Node {
        &self.shared.local
    }

    /// Whether `node` is the node of this process.
    #[must_use]
    pub fn is_local(&self, node: &Node) -> bool {
        *node == self.shared.local
    }

    /// Path layout in use.
    #[must_use]
    pub fn paths(&self) -> &ClusterPaths {
        &self.shared.paths
    }

    /// Whether the watch task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }
}

impl<C> Drop for ClusterMembership<C>
where
    C: CoordinationClient,
{
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.cancel.cancel();
        }
    }
}

async fn watch_loop<C>(shared: Arc<Shared<C>>, mut events: WatchStream, cancel: CancellationToken)
where
    C: CoordinationClient,
{
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.next() => event,
        };

        let Some(event) = event else {
            warn!("Membership watch for {} ended", shared.local);
            break;
        };
        debug!("Membership event: {:?}", event);

        match event {
            WatchEvent::Suspended => {
                warn!("Coordination connection suspended; membership may be stale");
                continue;
            }
            WatchEvent::Reconnected if shared.registered.load(Ordering::Acquire) => {
                info!("Coordination connection restored, re-registering {}", shared.local);
                if let Err(e) = shared.register().await {
                    error!("Failed to re-register {}: {}", shared.local, e);
                }
            }
            _ => {}
        }

        match shared.refresh().await {
            Ok(snapshot) => shared.notify(&snapshot),
            Err(e) => error!("Failed to rebuild membership: {}", e),
        }
    }
}
