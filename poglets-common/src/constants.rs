//! Default ports and addresses for poglets services.

/// Default port for the public data plane.
pub const DEFAULT_DATA_PORT: u16 = 8000;

/// Default port for the control plane (client websocket connections).
pub const DEFAULT_CONTROL_PORT: u16 = 8001;

/// Default bind address for both listeners.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";

/// Environment variable that overrides the server token.
pub const TOKEN_ENV_VAR: &str = "TOKEN";
