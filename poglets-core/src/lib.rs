//! Tunnel protocol engine for poglets
//!
//! - [`router`]: route key to upstream resolution
//! - [`stream`]: per-request streams with flow control
//! - [`session`]: control sessions, their handshake and state machine
//! - [`transport`]: WebSocket and raw IO carriers for frames
//! - [`tunnel`]: long-running client and server control planes

pub mod auth;
pub mod reconnect;
pub mod router;
pub mod session;
pub mod stream;
pub mod transport;
pub mod tunnel;

pub use router::UpstreamRouter;
pub use session::{
    AcceptPolicy, Capabilities, ClientHello, CloseReason, ControlSession, Established,
    IncomingStream, IncomingStreams, Role, SessionState, SessionStore,
};
pub use stream::{StreamEvent, StreamHandle, StreamReader, StreamWriter};
pub use tunnel::client::TunnelClient;
pub use tunnel::server::TunnelServer;
