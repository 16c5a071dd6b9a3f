//! HTTP edges of the tunnel
//!
//! [`HttpIngress`] is the server data plane: it turns public requests into
//! tunnel streams. [`HttpForwarder`] runs on the client and replays those
//! streams against the configured local upstream.

pub mod forwarder;
pub mod head;
pub mod ingress;
pub mod pool;
pub mod wrapping;

#[cfg(test)]
mod test_support;

pub use forwarder::HttpForwarder;
pub use ingress::{status_for, HttpIngress, IngressConfig, RouteScheme};
pub use pool::{ConnectionPool, PoolConfig, Upstream};
pub use wrapping::HeaderPolicy;
