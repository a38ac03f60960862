use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use relay_coordination::CoordinationClient;
use relay_membership::{ClusterMembership, ListenerError, MembershipSnapshot, Node};
use relay_rpc::{ClientPools, HandlerError, Request, RequestHandler, RpcServer};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::RouterConfig;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::monitor::{MetricCollector, MetricRegistry, Monitor, RouteMetrics};
use crate::processor::{DataTypeSelector, Processor, ProcessorSelector};
use crate::rules::RuleWatcher;
use crate::strategy::{RouteStrategy, RouteStrategyRegistry};

/// Why an event was not delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// The router has not been started or was stopped.
    NotRunning,
    /// The strategy found no node for the event.
    NoTarget,
    /// No local processor was selected for the event.
    NoProcessor,
    /// The local processor failed.
    ProcessFailed(String),
    /// The event could not be delivered to the remote node.
    SendFailed(String),
    /// The remote node received the event but refused it.
    RemoteRejected(String),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRunning => f.write_str("router not running"),
            Self::NoTarget => f.write_str("no target node"),
            Self::NoProcessor => f.write_str("no processor selected"),
            Self::ProcessFailed(e) => write!(f, "processing failed: {e}"),
            Self::SendFailed(e) => write!(f, "send failed: {e}"),
            Self::RemoteRejected(e) => write!(f, "remote rejected: {e}"),
        }
    }
}

/// Result of [`Router::route`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Processed on this node.
    Local(Node),
    /// Acknowledged by a remote node.
    Remote(Node),
    /// Not delivered.
    Dropped(DropReason),
}

impl RouteOutcome {
    /// Whether the event reached a processor or a remote node.
    #[must_use]
    pub const fn is_delivered(&self) -> bool {
        !matches!(self, Self::Dropped(_))
    }
}

struct Dispatcher {
    processors: Vec<Arc<dyn Processor>>,
    selector: Arc<dyn ProcessorSelector>,
}

impl Dispatcher {
    async fn dispatch(&self, event: Event) -> std::result::Result<(), DropReason> {
        let Some(processor) = self.selector.select(&event, &self.processors) else {
            warn!(
                "No processor for event from {} of type {}",
                event.source_name, event.data_type
            );
            return Err(DropReason::NoProcessor);
        };

        let name = processor.name().to_string();
        processor.process(event).await.map_err(|e| {
            warn!("Processor {} failed: {}", name, e);
            DropReason::ProcessFailed(e.to_string())
        })
    }
}

/// Serves events sent by other nodes.
struct InboundHandler {
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<RouteMetrics>,
}

#[async_trait]
impl RequestHandler for InboundHandler {
    async fn handle(&self, request: Request) -> std::result::Result<Bytes, HandlerError> {
        let event = Event::from_bytes(&request.payload)
            .map_err(|e| HandlerError::BadRequest(e.to_string()))?;
        self.metrics.record_inbound();

        if let Err(reason) = self.dispatcher.dispatch(event).await {
            debug!("Inbound event dropped: {}", reason);
        }
        Ok(Bytes::new())
    }
}

struct Running<C>
where
    C: CoordinationClient,
{
    server: RpcServer,
    membership: Arc<ClusterMembership<C>>,
    rules: Option<RuleWatcher<C>>,
    monitor: Option<Monitor>,
}

/// A routing node.
///
/// Accepts events from local sources through [`route`](Self::route) and from
/// peers over RPC, and delivers each to exactly one node of the cluster as
/// chosen by the configured [`RouteStrategy`].
pub struct Router<C>
where
    C: CoordinationClient,
{
    config: RouterConfig,
    client: C,
    dispatcher: Arc<Dispatcher>,
    strategy: Box<dyn RouteStrategy>,
    pools: Arc<ClientPools>,
    rule_selector: Option<Arc<DataTypeSelector>>,
    metrics: MetricRegistry,
    route_metrics: Arc<RouteMetrics>,
    running: RwLock<Option<Arc<Running<C>>>>,
    lifecycle: Mutex<()>,
}

impl<C> Router<C>
where
    C: CoordinationClient,
{
    /// Create a stopped router.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownRouteStrategy`] if `config.route_strategy` is
    /// not in `registry`.
    pub fn new(
        config: RouterConfig,
        client: C,
        processors: Vec<Arc<dyn Processor>>,
        selector: Arc<dyn ProcessorSelector>,
        registry: &RouteStrategyRegistry,
    ) -> Result<Self> {
        let strategy = registry.create(&config.route_strategy, &config)?;
        let pools = Arc::new(ClientPools::new(config.client_config(), config.pool.clone()));
        let route_metrics = Arc::new(RouteMetrics::default());
        let metrics = MetricRegistry::new();
        metrics.register(Arc::clone(&route_metrics) as Arc<dyn MetricCollector>);

        Ok(Self {
            config,
            client,
            dispatcher: Arc::new(Dispatcher {
                processors,
                selector,
            }),
            strategy,
            pools,
            rule_selector: None,
            metrics,
            route_metrics,
            running: RwLock::new(None),
            lifecycle: Mutex::new(()),
        })
    }

    /// Keep `selector` mapped from the cluster's rules while running.
    ///
    /// Pass the same selector to [`new`](Self::new) for the rules to decide
    /// which processor handles an event.
    #[must_use]
    pub fn with_rules(mut self, selector: Arc<DataTypeSelector>) -> Self {
        self.rule_selector = Some(selector);
        self
    }

    /// Include `collector` in the published metrics.
    pub fn register_collector(&self, collector: Arc<dyn MetricCollector>) {
        self.metrics.register(collector);
    }

    /// Bind the RPC server and join the cluster.
    ///
    /// The server binds the first free port at or above `route_port`; the
    /// node registers itself with the port actually bound. Rules are loaded
    /// before the router accepts events, and metrics publication starts
    /// when enabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the router is running, no port can be bound,
    /// registration fails or the rules cannot be loaded.
    #[instrument(skip(self), fields(cluster = %self.config.cluster_id))]
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.running.read().is_some() {
            return Err(Error::AlreadyStarted);
        }

        let handler = InboundHandler {
            dispatcher: Arc::clone(&self.dispatcher),
            metrics: Arc::clone(&self.route_metrics),
        };
        let server = RpcServer::bind_with_retry(
            &self.config.route_host,
            self.config.route_port,
            handler,
            self.config.server_config(),
        )
        .await?;
        server.start();

        let local = Node::local(
            &self.config.cluster_id,
            &self.config.route_host,
            server.local_addr().port(),
        );
        let membership = Arc::new(ClusterMembership::new(
            self.client.clone(),
            &self.config.membership(),
            local,
        ));

        if let Err(e) = membership.start().await {
            server.shutdown().await;
            return Err(e.into());
        }

        let pools = Arc::downgrade(&self.pools);
        membership.subscribe(move |snapshot: &MembershipSnapshot| -> std::result::Result<(), ListenerError> {
            if let Some(pools) = pools.upgrade() {
                let live: HashSet<String> = snapshot.endpoints().into_iter().collect();
                pools.retain(|endpoint| live.contains(endpoint));
            }
            Ok(())
        });

        let rules = match self.start_rules(&membership).await {
            Ok(rules) => rules,
            Err(e) => {
                if let Err(e) = membership.unregister().await {
                    warn!("Failed to withdraw {}: {}", membership.local_node(), e);
                }
                membership.stop().await;
                server.shutdown().await;
                return Err(e);
            }
        };

        let monitor = self.config.monitor.enabled.then(|| {
            Monitor::spawn(
                self.client.clone(),
                membership.paths().monitor_entry(&membership.local_node().id()),
                self.metrics.clone(),
                &self.config.monitor,
            )
        });

        info!(
            "Router {} started with {} strategy",
            membership.local_node(),
            self.strategy.name()
        );
        *self.running.write() = Some(Arc::new(Running {
            server,
            membership,
            rules,
            monitor,
        }));
        Ok(())
    }

    async fn start_rules(
        &self,
        membership: &ClusterMembership<C>,
    ) -> Result<Option<RuleWatcher<C>>> {
        let Some(selector) = &self.rule_selector else {
            return Ok(None);
        };
        let watcher = RuleWatcher::new(self.client.clone(), membership.paths(), Arc::clone(selector));
        watcher.start().await?;
        Ok(Some(watcher))
    }

    /// Deliver `event` to the node chosen by the strategy.
    ///
    /// Failures are logged and reported in the outcome; the event is not
    /// retried and never falls back to another node.
    #[instrument(skip(self, event), fields(source = %event.source_name, data_type = %event.data_type))]
    pub async fn route(&self, event: Event) -> RouteOutcome {
        let outcome = self.deliver(event).await;
        self.route_metrics.record(&outcome);
        outcome
    }

    async fn deliver(&self, event: Event) -> RouteOutcome {
        let running = self.running.read().clone();
        let Some(running) = running else {
            warn!("Router not running, dropping event");
            return RouteOutcome::Dropped(DropReason::NotRunning);
        };

        let snapshot = running.membership.nodes();
        let Some(target) = self.strategy.route(&event, snapshot.nodes()) else {
            warn!("No target node among {} nodes, dropping event", snapshot.len());
            return RouteOutcome::Dropped(DropReason::NoTarget);
        };

        if running.membership.is_local(&target) {
            debug!("Processing event locally");
            return match self.dispatcher.dispatch(event).await {
                Ok(()) => RouteOutcome::Local(target),
                Err(reason) => RouteOutcome::Dropped(reason),
            };
        }

        match self.send(&target, &event).await {
            Ok(()) => {
                debug!("Event delivered to {}", target);
                RouteOutcome::Remote(target)
            }
            Err(reason) => {
                warn!("Dropping event for {}: {}", target, reason);
                RouteOutcome::Dropped(reason)
            }
        }
    }

    async fn send(&self, target: &Node, event: &Event) -> std::result::Result<(), DropReason> {
        let payload = event
            .to_bytes()
            .map_err(|e| DropReason::SendFailed(e.to_string()))?;

        let pool = self.pools.get(&target.host, target.port);
        let client = pool
            .borrow()
            .await
            .map_err(|e| DropReason::SendFailed(e.to_string()))?;

        match client.call(Request::new(payload), self.config.rpc_timeout).await {
            Ok(response) => {
                client.release();
                response
                    .error
                    .map_or(Ok(()), |error| Err(DropReason::RemoteRejected(error.to_string())))
            }
            Err(e) if e.is_connection_healthy() => {
                client.release();
                Err(DropReason::SendFailed(e.to_string()))
            }
            Err(e) => {
                client.invalidate();
                Err(DropReason::SendFailed(e.to_string()))
            }
        }
    }

    /// Leave the cluster and release every network resource.
    ///
    /// The local entry is withdrawn first so peers stop routing here. Safe to
    /// call more than once.
    #[instrument(skip(self), fields(cluster = %self.config.cluster_id))]
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let running = self.running.write().take();
        let Some(running) = running else {
            debug!("Router already stopped");
            return;
        };

        if let Err(e) = running.membership.unregister().await {
            warn!("Failed to withdraw {}: {}", running.membership.local_node(), e);
        }
        running.server.shutdown().await;
        if let Some(rules) = &running.rules {
            rules.stop().await;
        }
        if let Some(monitor) = &running.monitor {
            monitor.stop().await;
        }
        running.membership.stop().await;
        self.pools.close_all();

        info!("Router {} stopped", running.membership.local_node());
    }

    /// The registered local node, while running.
    #[must_use]
    pub fn local_node(&self) -> Option<Node> {
        self.running
            .read()
            .as_ref()
            .map(|running| running.membership.local_node().clone())
    }

    /// Port the RPC server is bound to, while running.
    #[must_use]
    pub fn bound_port(&self) -> Option<u16> {
        self.running
            .read()
            .as_ref()
            .map(|running| running.server.local_addr().port())
    }

    /// Cluster membership, while running.
    #[must_use]
    pub fn membership(&self) -> Option<Arc<ClusterMembership<C>>> {
        self.running
            .read()
            .as_ref()
            .map(|running| Arc::clone(&running.membership))
    }

    /// Whether the router has been started and not stopped.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.read().is_some()
    }

    /// Configuration the router was created with.
    #[must_use]
    pub const fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Name of the route strategy in use.
    #[must_use]
    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    /// Collectors published by the monitor.
    #[must_use]
    pub const fn metrics(&self) -> &MetricRegistry {
        &self.metrics
    }

    /// Counts of routing outcomes since creation.
    #[must_use]
    pub fn route_metrics(&self) -> &RouteMetrics {
        &self.route_metrics
    }

    /// Client pools for remote nodes.
    #[must_use]
    pub fn pools(&self) -> &ClientPools {
        &self.pools
    }
}
