//! # poglets
//!
//! Reverse tunnel for exposing local HTTP services through a public server.
//!
//! ## Overview
//!
//! A poglets server accepts public HTTP requests on its data port and
//! relays each one over a multiplexed WebSocket control session to a
//! connected client. The client replays the request against a local
//! upstream and streams the response back.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use poglets::{Client, Server};
//!
//! # async fn example() -> poglets::Result<()> {
//! let mut server = Server::builder().token("secret").build()?;
//! server.start().await?;
//!
//! let mut client = Client::builder()
//!     .url("ws://127.0.0.1:8001")
//!     .insecure(true)
//!     .token("secret")
//!     .upstream("127.0.0.1:3000")
//!     .build()?;
//! client.start().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`protocol`] - wire frames and the incremental codec
//! - [`common`] - errors, configuration, token helpers
//! - [`core`] - sessions, streams, routing, control-plane drivers
//! - [`http`] - public listener and upstream forwarder

pub mod client;
pub mod config;
pub mod server;

// Re-export subcrates
pub use poglets_common as common;
pub use poglets_core as core;
pub use poglets_http as http;
pub use poglets_protocol as protocol;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::client::{Client, ClientBuilder};
    pub use crate::config::{ClientConfig, ServerConfig, TunnelInfo};
    pub use crate::server::{Server, ServerBuilder};
    pub use crate::common::{Result, TunnelError};
}

pub use client::{Client, ClientBuilder};
pub use common::{Result, TunnelError};
pub use config::{ClientConfig, ServerConfig, TunnelInfo};
pub use server::{Server, ServerBuilder};
