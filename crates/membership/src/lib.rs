//! Cluster membership for routing nodes.
//!
//! Every node registers an ephemeral entry named `host:port` under
//! `{root}/{cluster_id}/node` and watches its siblings. The resulting
//! [`MembershipSnapshot`] always contains the local node once registered and
//! is handed in full to every listener after each change.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod error;
mod membership;
mod node;

pub use error::{Error, Result};
pub use membership::{
    ClusterMembership, ListenerError, MembershipConfig, MembershipListener, MembershipSnapshot,
    SubscriptionId,
};
pub use node::Node;
