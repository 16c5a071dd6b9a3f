//! Transport wrapping: response header normalisation applied by the client
//! before an upstream response is relayed

use hyper::header::{HeaderMap, HeaderName};

/// Cross-origin headers removed by [`HeaderPolicy::default`].
pub const CROSS_ORIGIN_HEADERS: [&str; 9] = [
    "access-control-allow-origin",
    "access-control-allow-credentials",
    "access-control-allow-methods",
    "access-control-allow-headers",
    "access-control-expose-headers",
    "access-control-max-age",
    "cross-origin-opener-policy",
    "cross-origin-embedder-policy",
    "cross-origin-resource-policy",
];

/// Table of response headers stripped while wrapping is enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderPolicy {
    strip: Vec<HeaderName>,
}

impl Default for HeaderPolicy {
    fn default() -> Self {
        Self {
            strip: CROSS_ORIGIN_HEADERS
                .into_iter()
                .map(HeaderName::from_static)
                .collect(),
        }
    }
}

impl HeaderPolicy {
    /// Policy that strips nothing.
    pub fn passthrough() -> Self {
        Self { strip: Vec::new() }
    }

    #[must_use]
    pub fn with_header(mut self, name: HeaderName) -> Self {
        if !self.strip.contains(&name) {
            self.strip.push(name);
        }
        self
    }

    pub fn headers(&self) -> &[HeaderName] {
        &self.strip
    }

    pub fn apply(&self, headers: &mut HeaderMap) {
        for name in &self.strip {
            headers.remove(name);
        }
    }
}
