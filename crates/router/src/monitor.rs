//! Periodic publication of node metrics to the coordination service.
//!
//! Registered [`MetricCollector`]s are polled on a fixed schedule and the
//! combined list is written as a JSON array to
//! `{root}/{cluster}/monitor/{host:port}`.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use relay_coordination::{CoordinationClient, CoordinationError, CoordinationErrorKind};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::router::RouteOutcome;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Schedule for publishing metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Whether the router publishes metrics at all.
    pub enabled: bool,
    /// Delay before the first publication.
    pub initial_delay: Duration,
    /// Time between publications.
    pub interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_secs(30),
            interval: Duration::from_secs(60),
        }
    }
}

/// One named measurement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// Metric name.
    pub name: String,
    /// Measured value, rendered as text.
    pub value: String,
    /// Milliseconds since the Unix epoch when the value was taken.
    pub timestamp: u64,
    /// Free-form labels.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub tags: serde_json::Map<String, serde_json::Value>,
}

impl Metric {
    /// Metric taken now.
    pub fn new(name: impl Into<String>, value: impl ToString) -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_millis());
        Self {
            name: name.into(),
            value: value.to_string(),
            timestamp: u64::try_from(millis).unwrap_or(u64::MAX),
            tags: serde_json::Map::new(),
        }
    }

    /// Attach a label.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Source of metrics polled on every publication.
pub trait MetricCollector: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Current values.
    fn collect(&self) -> Vec<Metric>;
}

/// Collectors whose output is published together.
#[derive(Clone, Default)]
pub struct MetricRegistry {
    collectors: Arc<RwLock<Vec<Arc<dyn MetricCollector>>>>,
}

impl MetricRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `collector` to every later publication.
    pub fn register(&self, collector: Arc<dyn MetricCollector>) {
        debug!("Registered metric collector {}", collector.name());
        self.collectors.write().push(collector);
    }

    /// Number of registered collectors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.collectors.read().len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.collectors.read().is_empty()
    }

    /// Output of every collector. A panicking collector contributes nothing.
    #[must_use]
    pub fn collect(&self) -> Vec<Metric> {
        let collectors: Vec<_> = self.collectors.read().iter().map(Arc::clone).collect();

        let mut metrics = Vec::new();
        for collector in collectors {
            match catch_unwind(AssertUnwindSafe(|| collector.collect())) {
                Ok(batch) => metrics.extend(batch),
                Err(_) => error!("Metric collector {} panicked", collector.name()),
            }
        }
        metrics
    }
}

impl std::fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricRegistry")
            .field("collectors", &self.len())
            .finish()
    }
}

/// Counts of routing outcomes on this node.
#[derive(Debug, Default)]
pub struct RouteMetrics {
    local: AtomicU64,
    remote: AtomicU64,
    dropped: AtomicU64,
    inbound: AtomicU64,
}

impl RouteMetrics {
    /// Count one routed event.
    pub fn record(&self, outcome: &RouteOutcome) {
        let counter = match outcome {
            RouteOutcome::Local(_) => &self.local,
            RouteOutcome::Remote(_) => &self.remote,
            RouteOutcome::Dropped(_) => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one event received from a peer.
    pub fn record_inbound(&self) {
        self.inbound.fetch_add(1, Ordering::Relaxed);
    }

    /// Events processed on this node after routing.
    #[must_use]
    pub fn local(&self) -> u64 {
        self.local.load(Ordering::Relaxed)
    }

    /// Events acknowledged by another node.
    #[must_use]
    pub fn remote(&self) -> u64 {
        self.remote.load(Ordering::Relaxed)
    }

    /// Events not delivered.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Events received from peers.
    #[must_use]
    pub fn inbound(&self) -> u64 {
        self.inbound.load(Ordering::Relaxed)
    }
}

impl MetricCollector for RouteMetrics {
    fn name(&self) -> &str {
        "route"
    }

    fn collect(&self) -> Vec<Metric> {
        vec![
            Metric::new("route.local", self.local()),
            Metric::new("route.remote", self.remote()),
            Metric::new("route.dropped", self.dropped()),
            Metric::new("route.inbound", self.inbound()),
        ]
    }
}

/// Write `metrics` to `path`, creating the entry on first use.
///
/// # Errors
///
/// Returns an error if the coordination service fails.
pub async fn publish<C>(client: &C, path: &str, metrics: &[Metric]) -> Result<()>
where
    C: CoordinationClient,
{
    let data = serde_json::to_vec(metrics)
        .map(Bytes::from)
        .map_err(|e| Error::InvalidMetrics(e.to_string()))?;

    match client.set_data(path, data.clone()).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == CoordinationErrorKind::NoNode => client
            .create_persistent(path, data)
            .await
            .map_err(Error::coordination),
        Err(e) => Err(Error::coordination(e)),
    }
}

/// Background task publishing a registry on a schedule.
pub struct Monitor {
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Monitor {
    /// Start publishing `registry` to `path` as `config` schedules.
    pub fn spawn<C>(client: C, path: String, registry: MetricRegistry, config: &MonitorConfig) -> Self
    where
        C: CoordinationClient,
    {
        let cancel = CancellationToken::new();
        info!(
            "Publishing metrics to {} every {:?} after {:?}",
            path, config.interval, config.initial_delay
        );
        let handle = tokio::spawn(publish_loop(
            client,
            path,
            registry,
            config.clone(),
            cancel.clone(),
        ));
        Self {
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stop publishing. The last published entry stays in place.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            match tokio::time::timeout(STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!("Monitor task completed"),
                Ok(Err(e)) => warn!("Monitor task failed: {}", e),
                Err(_) => warn!("Monitor task timed out"),
            }
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn publish_loop<C>(
    client: C,
    path: String,
    registry: MetricRegistry,
    config: MonitorConfig,
    cancel: CancellationToken,
) where
    C: CoordinationClient,
{
    let interval = config.interval.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + config.initial_delay, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let metrics = registry.collect();
        match publish(&client, &path, &metrics).await {
            Ok(()) => debug!("Published {} metrics to {}", metrics.len(), path),
            Err(e) => warn!("Failed to publish metrics to {}: {}", path, e),
        }
    }
}
