//! Authentication token sources

use crate::error::{Result, TunnelError};
use std::path::Path;
use tracing::debug;

/// Resolve the token from a literal value or a file.
///
/// File contents win over the literal and lose their trailing newlines.
pub fn load_token(token: Option<&str>, token_from: Option<&Path>) -> Result<String> {
    if let Some(path) = token_from {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TunnelError::Config(format!("unable to load token file {}: {e}", path.display()))
        })?;
        debug!("Loaded token from {}", path.display());
        return Ok(raw.trim_end_matches('\n').to_string());
    }
    Ok(token.unwrap_or_default().to_string())
}

/// A non-empty environment value replaces the configured token.
pub fn with_env_override(token: String, env_value: Option<String>) -> String {
    match env_value {
        Some(value) if !value.is_empty() => value,
        _ => token,
    }
}
