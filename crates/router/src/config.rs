//! Router configuration.

use std::time::Duration;

use relay_coordination::DEFAULT_ROOT;
use relay_hashring::DEFAULT_REPLICAS;
use relay_membership::MembershipConfig;
use relay_rpc::{BodyFormat, ClientConfig, PoolConfig, ServerConfig};
use serde::{Deserialize, Serialize};

use crate::monitor::MonitorConfig;

/// Port the router tries first.
pub const DEFAULT_ROUTE_PORT: u16 = 8404;

/// Configuration for a [`Router`](crate::Router).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Cluster to join.
    pub cluster_id: String,
    /// Root path in the coordination service.
    pub coordination_root: String,
    /// Name of the route strategy in the registry.
    pub route_strategy: String,
    /// Host the RPC server binds to and advertises.
    pub route_host: String,
    /// First port to try; the next free port is used if taken.
    pub route_port: u16,
    /// Deadline for delivering one event to a remote node.
    pub rpc_timeout: Duration,
    /// Virtual nodes per node for the hash strategy.
    pub hash_replicas: usize,
    /// Body serializer for both directions.
    pub body_format: BodyFormat,
    /// Outbound client settings.
    pub client: ClientConfig,
    /// Inbound server settings.
    pub server: ServerConfig,
    /// Per-endpoint pool settings.
    pub pool: PoolConfig,
    /// Metrics publication schedule.
    pub monitor: MonitorConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cluster_id: "cluster1".to_string(),
            coordination_root: DEFAULT_ROOT.to_string(),
            route_strategy: "hash".to_string(),
            route_host: "127.0.0.1".to_string(),
            route_port: DEFAULT_ROUTE_PORT,
            rpc_timeout: Duration::from_secs(10),
            hash_replicas: DEFAULT_REPLICAS,
            body_format: BodyFormat::default(),
            client: ClientConfig::default(),
            server: ServerConfig::default(),
            pool: PoolConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl RouterConfig {
    /// Membership settings derived from this configuration.
    #[must_use]
    pub fn membership(&self) -> MembershipConfig {
        MembershipConfig {
            cluster_id: self.cluster_id.clone(),
            root: self.coordination_root.clone(),
        }
    }

    /// Client settings with the router-wide body format applied.
    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            body_format: self.body_format,
            ..self.client.clone()
        }
    }

    /// Server settings with the router-wide body format applied.
    #[must_use]
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            body_format: self.body_format,
            ..self.server.clone()
        }
    }
}
