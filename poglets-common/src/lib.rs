//! Common utilities and types for poglets

pub mod config;
pub mod constants;
pub mod error;
pub mod token;

pub use config::{LimitsConfig, ResilienceConfig, SessionConfig};
pub use constants::{DEFAULT_BIND_ADDR, DEFAULT_CONTROL_PORT, DEFAULT_DATA_PORT, TOKEN_ENV_VAR};
pub use error::{Result, TunnelError};
