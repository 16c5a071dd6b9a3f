//! Configuration types shared by the tunnel server and client

use poglets_protocol::constants::DEFAULT_STREAM_WINDOW;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timers and budgets for one control session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Send a keepalive after this long without outbound traffic
    pub keepalive_interval: Duration,
    /// Close the session after this long without any inbound frame
    pub keepalive_timeout: Duration,
    /// Force-close a stream with no frame in either direction for this long
    pub stream_idle_timeout: Duration,
    /// Wall-clock budget for a complete response (server side)
    pub response_deadline: Duration,
    /// How long a draining session waits for streams to finish
    pub drain_timeout: Duration,
    /// Budget for the authentication exchange
    pub handshake_timeout: Duration,
    /// Per-stream receive window advertised to the peer
    pub stream_window: u32,
    /// Maximum concurrently open streams
    pub max_streams: usize,
    /// Capacity of the outbound frame queue
    pub outbound_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(30),
            stream_idle_timeout: Duration::from_secs(60),
            response_deadline: Duration::from_secs(300),
            drain_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            stream_window: DEFAULT_STREAM_WINDOW,
            max_streams: 1024,
            outbound_queue: 1024,
        }
    }
}

impl SessionConfig {
    /// Granularity of the session timer sweep.
    pub fn tick_interval(&self) -> Duration {
        let finest = self
            .keepalive_interval
            .min(self.stream_idle_timeout / 4)
            .min(Duration::from_secs(1));
        finest.max(Duration::from_millis(10))
    }
}

/// Resource limits applied while accepting sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum frame payload in bytes (default: 16MB)
    pub max_frame_bytes: u64,
    /// Maximum concurrent control sessions per server
    pub max_sessions: usize,
    /// Maximum token length in bytes
    pub max_token_len: usize,
    /// Maximum number of capabilities
    pub max_capabilities: usize,
    /// Maximum number of route keys a client may advertise
    pub max_routes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 16 * 1024 * 1024,
            max_sessions: 64,
            max_token_len: 256,
            max_capabilities: 32,
            max_routes: 32,
        }
    }
}

/// Reconnection policy for the client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Base delay for reconnection backoff
    pub reconnect_base: Duration,
    /// Maximum delay for reconnection backoff
    pub reconnect_max: Duration,
    /// Jitter factor (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            jitter_factor: 0.3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_tracks_short_timeouts() {
        let config = SessionConfig {
            stream_idle_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        assert_eq!(config.tick_interval(), Duration::from_millis(50));
        assert_eq!(SessionConfig::default().tick_interval(), Duration::from_secs(1));
    }
}
