//! Socket options for control connections
//!
//! - `TCP_NODELAY`: frames are small and latency sensitive
//! - TCP keepalive: lets the kernel notice dead peers even when the
//!   session keepalive is slowed down by a congested writer

use socket2::SockRef;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;

const KEEPALIVE_TIME: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

pub fn configure_socket(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(KEEPALIVE_TIME)
        .with_interval(KEEPALIVE_INTERVAL);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)?;

    Ok(())
}

pub fn configure_socket_silent(stream: &TcpStream) {
    if let Err(e) = configure_socket(stream) {
        tracing::debug!("Socket tuning skipped: {e}");
    }
}
