//! Client reconnect policy
//!
//! The retry loop itself lives in the tunnel client; this module only
//! decides how long to wait and whether another attempt is allowed.

use poglets_common::config::ResilienceConfig;
use rand::Rng;
use std::time::Duration;

/// Backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound for any delay, jitter included
    pub max: Duration,
    /// Growth per failed attempt
    pub factor: f64,
    /// Jitter factor (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        ResilienceConfig::default().into()
    }
}

impl From<ResilienceConfig> for BackoffConfig {
    fn from(config: ResilienceConfig) -> Self {
        Self {
            base: config.reconnect_base,
            max: config.reconnect_max,
            factor: 2.0,
            jitter: config.jitter_factor.clamp(0.0, 1.0),
        }
    }
}

/// Exponential backoff calculator
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay for the current attempt; advances the attempt counter.
    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Call after a session reached `Active`.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let max_secs = self.config.max.as_secs_f64();
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let nominal = (self.config.base.as_secs_f64() * self.config.factor.powi(exponent))
            .min(max_secs);

        let spread = nominal * self.config.jitter;
        let jitter = if spread > 0.0 {
            rand::rng().random_range(-spread..=spread)
        } else {
            0.0
        };

        Duration::from_secs_f64((nominal + jitter).clamp(0.0, max_secs))
    }
}

/// Where the client is in its connect cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    /// Dialing and authenticating
    Connecting,
    /// A session is active
    Connected,
    /// Waiting out a backoff delay
    Backoff,
    /// Out of attempts, or shut down by the operator
    Stopped,
}

/// Tracks attempts across sessions. `max_attempts: None` retries forever.
#[derive(Debug)]
pub struct ReconnectManager {
    backoff: Backoff,
    state: ReconnectState,
    max_attempts: Option<u32>,
}

impl ReconnectManager {
    #[must_use]
    pub fn new(config: BackoffConfig, max_attempts: Option<u32>) -> Self {
        Self {
            backoff: Backoff::new(config),
            state: ReconnectState::Connecting,
            max_attempts,
        }
    }

    pub fn on_connected(&mut self) {
        self.backoff.reset();
        self.state = ReconnectState::Connected;
    }

    /// Record a failed attempt or a lost session.
    ///
    /// Returns the delay before the next attempt, or `None` when no attempt
    /// is left.
    pub fn on_disconnected(&mut self) -> Option<Duration> {
        if self
            .max_attempts
            .is_some_and(|max| self.backoff.attempts() >= max)
        {
            self.state = ReconnectState::Stopped;
            return None;
        }
        self.state = ReconnectState::Backoff;
        Some(self.backoff.next_delay())
    }

    pub fn start_attempt(&mut self) {
        if self.state != ReconnectState::Stopped {
            self.state = ReconnectState::Connecting;
        }
    }

    pub fn stop(&mut self) {
        self.state = ReconnectState::Stopped;
    }

    #[must_use]
    pub fn state(&self) -> ReconnectState {
        self.state
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.backoff.attempts()
    }

    #[must_use]
    pub fn should_retry(&self) -> bool {
        self.state != ReconnectState::Stopped
    }
}
