//! CLI binary to run a relay cluster locally.
//!
//! Starts `--nodes` routers in one process, sharing an in-memory
//! coordination service, then reads JSON events from stdin (one per line)
//! and routes them through the routers in turn.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use relay_coordination_memory::{MemoryCoordinator, MemorySession};
use relay_router::{
    Event, ProcessError, Processor, ProcessorSelector, RouteOutcome, RouteStrategyRegistry, Router,
    RouterConfig,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Router error
    #[error(transparent)]
    Router(#[from] relay_router::Error),

    /// Reading events failed
    #[error("input error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Number of routers to start
    #[arg(long, default_value_t = 3, env = "RELAY_NODES")]
    nodes: usize,

    /// Cluster the routers join
    #[arg(long, default_value = "cluster1", env = "RELAY_CLUSTER_ID")]
    cluster_id: String,

    /// Host the routers bind to
    #[arg(long, default_value = "127.0.0.1", env = "RELAY_HOST")]
    host: String,

    /// First port to try; each router takes the next free one
    #[arg(long, default_value_t = relay_router::DEFAULT_ROUTE_PORT, env = "RELAY_BASE_PORT")]
    base_port: u16,

    /// Route strategy (`hash` or `local`)
    #[arg(long, default_value = "hash", env = "RELAY_ROUTE_STRATEGY")]
    route_strategy: String,

    /// Deadline for delivering an event to another node
    #[arg(long, default_value_t = 10_000, env = "RELAY_RPC_TIMEOUT_MS")]
    rpc_timeout_ms: u64,

    /// Virtual nodes per router on the hash ring
    #[arg(long, default_value_t = default_hash_replicas(), env = "RELAY_HASH_REPLICAS")]
    hash_replicas: usize,
}

fn default_hash_replicas() -> usize {
    RouterConfig::default().hash_replicas
}

impl Args {
    fn router_config(&self) -> RouterConfig {
        RouterConfig {
            cluster_id: self.cluster_id.clone(),
            route_strategy: self.route_strategy.clone(),
            route_host: self.host.clone(),
            route_port: self.base_port,
            rpc_timeout: Duration::from_millis(self.rpc_timeout_ms),
            hash_replicas: self.hash_replicas,
            ..RouterConfig::default()
        }
    }
}

/// Logs every event it receives.
struct LogProcessor {
    node: usize,
}

#[async_trait]
impl Processor for LogProcessor {
    fn name(&self) -> &str {
        "log"
    }

    async fn process(&self, event: Event) -> Result<(), ProcessError> {
        info!(
            "router-{} processed {} event from {}: {:?}",
            self.node, event.data_type, event.source_name, event.payload
        );
        Ok(())
    }
}

/// Hands every event to the first processor.
struct FirstProcessor;

impl ProcessorSelector for FirstProcessor {
    fn select(
        &self,
        _event: &Event,
        processors: &[Arc<dyn Processor>],
    ) -> Option<Arc<dyn Processor>> {
        processors.first().cloned()
    }
}

async fn start_routers(
    args: &Args,
    coordinator: &MemoryCoordinator,
) -> Result<Vec<Router<MemorySession>>, Error> {
    let registry = RouteStrategyRegistry::new();
    let config = args.router_config();
    let mut routers = Vec::with_capacity(args.nodes);

    for node in 0..args.nodes {
        let processor: Arc<dyn Processor> = Arc::new(LogProcessor { node });
        let router = Router::new(
            config.clone(),
            coordinator.session(),
            vec![processor],
            Arc::new(FirstProcessor),
            &registry,
        )?;

        if let Err(e) = router.start().await {
            stop_routers(&routers).await;
            return Err(e.into());
        }
        info!(
            "router-{} listening on port {}",
            node,
            router.bound_port().unwrap_or_default()
        );
        routers.push(router);
    }

    Ok(routers)
}

async fn stop_routers(routers: &[Router<MemorySession>]) {
    for router in routers {
        router.stop().await;
    }
}

async fn route_stdin(
    routers: &[Router<MemorySession>],
    shutdown: &CancellationToken,
) -> Result<(), Error> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut next = 0;

    loop {
        let line = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            info!("End of input");
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        let event = match Event::from_bytes(line.as_bytes()) {
            Ok(event) => event,
            Err(e) => {
                warn!("Skipping line: {}", e);
                continue;
            }
        };

        let router = &routers[next % routers.len()];
        next += 1;

        match router.route(event).await {
            RouteOutcome::Local(node) => info!("Handled locally on {}", node),
            RouteOutcome::Remote(node) => info!("Forwarded to {}", node),
            RouteOutcome::Dropped(reason) => warn!("Dropped: {}", reason),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.nodes == 0 {
        warn!("Nothing to run with --nodes 0");
        return Ok(());
    }

    let shutdown_token = CancellationToken::new();

    let signal_shutdown_token = shutdown_token.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(mut sigterm), Ok(mut sigint)) => {
                    tokio::select! {
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                        _ = sigint.recv() => info!("Received SIGINT"),
                    }
                }
                _ => {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Received interrupt signal");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received interrupt signal");
        }

        info!("Shutting down");
        signal_shutdown_token.cancel();
    });

    let coordinator = MemoryCoordinator::new();
    let routers = start_routers(&args, &coordinator).await?;
    info!(
        "{} routers up in {} using {} routing",
        routers.len(),
        args.cluster_id,
        args.route_strategy
    );

    let result = route_stdin(&routers, &shutdown_token).await;
    stop_routers(&routers).await;
    result
}
