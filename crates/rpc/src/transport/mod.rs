//! Transport layer: client, server, response futures and pooling over TCP.

pub mod client;
pub mod future;
pub mod pool;
pub mod server;
