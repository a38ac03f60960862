//! Event router for a cluster of relay nodes.
//!
//! A [`Router`] joins the cluster through [`relay_membership`], serves
//! inbound events over [`relay_rpc`] and delivers every routed [`Event`] to
//! exactly one node: the one picked by its [`RouteStrategy`]. Events that
//! land on the local node are handed to the [`Processor`] chosen by the
//! [`ProcessorSelector`].
//!
//! A router can also follow the cluster's routing [`rules`] to map data
//! types to processors, and publishes its [`monitor`] metrics to the
//! coordination service.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
pub mod error;
mod event;
pub mod monitor;
mod processor;
mod router;
pub mod rules;
mod strategy;

pub use config::{DEFAULT_ROUTE_PORT, RouterConfig};
pub use error::{Error, Result};
pub use event::Event;
pub use monitor::{Metric, MetricCollector, MetricRegistry, MonitorConfig, RouteMetrics};
pub use processor::{
    DataTypeSelector, ProcessError, Processor, ProcessorSelector, StaticSourceSelector,
};
pub use router::{DropReason, RouteOutcome, Router};
pub use rules::{Rule, RuleWatcher};
pub use strategy::{
    HashRouteStrategy, LocalRouteStrategy, RouteStrategy, RouteStrategyRegistry, StrategyFactory,
};
