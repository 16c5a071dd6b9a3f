//! Upstream route table
//!
//! Maps a route key to the upstream a request is forwarded to. The client
//! holds the real table; the server keeps a key-only copy built from the
//! handshake so it can reject requests no client route will accept.

use poglets_common::{Result, TunnelError};
use std::collections::HashMap;

/// Route key of the default (catch-all) entry
pub const DEFAULT_ROUTE: &str = "";

#[derive(Debug, Clone)]
pub struct UpstreamRouter<T = String> {
    routes: HashMap<String, T>,
    strict: bool,
}

impl<T> UpstreamRouter<T> {
    pub fn new(routes: HashMap<String, T>, strict: bool) -> Self {
        Self { routes, strict }
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.routes.iter().map(|(key, target)| (key.as_str(), target))
    }

    /// Build a table with the same keys and policy from converted targets.
    pub fn try_map<U, E>(
        &self,
        mut f: impl FnMut(&str, &T) -> std::result::Result<U, E>,
    ) -> std::result::Result<UpstreamRouter<U>, E> {
        let routes = self
            .iter()
            .map(|(key, target)| Ok((key.to_string(), f(key, target)?)))
            .collect::<std::result::Result<HashMap<_, _>, E>>()?;
        Ok(UpstreamRouter::new(routes, self.strict))
    }

    /// Resolve `key` to its target.
    ///
    /// Strict mode accepts exact matches only. Otherwise a miss falls back
    /// to the default entry, or to the only entry when exactly one exists.
    pub fn resolve(&self, key: &str) -> Result<&T> {
        if let Some(target) = self.routes.get(key) {
            return Ok(target);
        }
        if !self.strict {
            if let Some(target) = self.routes.get(DEFAULT_ROUTE) {
                return Ok(target);
            }
            if self.routes.len() == 1 {
                if let Some(target) = self.routes.values().next() {
                    return Ok(target);
                }
            }
        }
        Err(TunnelError::NoMatchingUpstream(key.to_string()))
    }
}

impl UpstreamRouter<String> {
    /// Build the client table from an `--upstream` value.
    pub fn from_spec(spec: &str, strict: bool) -> Result<Self> {
        Ok(Self::new(parse_upstream_spec(spec)?, strict))
    }
}

impl UpstreamRouter<()> {
    /// Key-only table used by the server to validate route keys.
    pub fn from_keys<I, S>(keys: I, strict: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(keys.into_iter().map(|k| (k.into(), ())).collect(), strict)
    }
}

/// Parse `key=value` or a bare `value` into a route table.
///
/// Only one entry is supported per client; the value is normalised with
/// [`normalize_upstream_url`].
pub fn parse_upstream_spec(spec: &str) -> Result<HashMap<String, String>> {
    let entries: Vec<&str> = spec
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .collect();

    if entries.len() > 1 {
        return Err(TunnelError::Config(
            "cannot use multiple upstream values; give a single --upstream target".to_string(),
        ));
    }
    let Some(entry) = entries.first() else {
        return Err(TunnelError::Config("an --upstream value is required".to_string()));
    };

    let (key, value) = match entry.split_once('=') {
        Some((key, value)) => (key.trim(), value.trim()),
        None => (DEFAULT_ROUTE, *entry),
    };
    if value.is_empty() {
        return Err(TunnelError::Config(format!(
            "upstream for route {key:?} has no target"
        )));
    }

    let mut routes = HashMap::with_capacity(1);
    routes.insert(key.to_string(), normalize_upstream_url(value));
    Ok(routes)
}

/// Prefix `http://` unless the value already names http or https.
pub fn normalize_upstream_url(value: &str) -> String {
    if value.starts_with("http://") || value.starts_with("https://") {
        value.to_string()
    } else {
        format!("http://{value}")
    }
}
