//! Conversions between hyper message heads and their wire form

use bytes::Bytes;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::http::request::Parts;
use poglets_protocol::{RequestHead, ResponseHead, WireHeaders};
use std::net::SocketAddr;
use tracing::debug;

/// Headers scoped to a single connection; never relayed.
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Encode `headers` for the wire, dropping hop-by-hop headers and any
/// header named in `Connection`.
pub fn to_wire(headers: &HeaderMap) -> WireHeaders {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .collect();

    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name) && !listed.iter().any(|l| l == name.as_str()))
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                Bytes::copy_from_slice(value.as_bytes()),
            )
        })
        .collect()
}

/// Rebuild a header map. Entries that are not valid HTTP are dropped.
pub fn from_wire(headers: &WireHeaders) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_maybe_shared(value.clone()),
        ) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => debug!("Dropping invalid header {name:?}"),
        }
    }
    map
}

/// Wire head for a public request.
///
/// Adds the usual `X-Forwarded-*` headers. A request that carries a body
/// without a declared length is marked chunked, so the forwarder can tell
/// it apart from a request with no body at all.
pub fn request_head(
    parts: &Parts,
    route_key: String,
    peer_addr: SocketAddr,
    has_body: bool,
) -> RequestHead {
    let mut headers = to_wire(&parts.headers);

    let forwarded_for = match parts.headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{prior}, {}", peer_addr.ip()),
        None => peer_addr.ip().to_string(),
    };
    headers.retain(|(name, _)| name != "x-forwarded-for");
    headers.push(("x-forwarded-for".to_string(), Bytes::from(forwarded_for)));

    if let Some(host) = parts.headers.get(header::HOST) {
        if !parts.headers.contains_key("x-forwarded-host") {
            headers.push((
                "x-forwarded-host".to_string(),
                Bytes::copy_from_slice(host.as_bytes()),
            ));
        }
    }
    if !parts.headers.contains_key("x-forwarded-proto") {
        headers.push(("x-forwarded-proto".to_string(), Bytes::from_static(b"http")));
    }

    if has_body && !parts.headers.contains_key(header::CONTENT_LENGTH) {
        headers.push((
            header::TRANSFER_ENCODING.as_str().to_string(),
            Bytes::from_static(b"chunked"),
        ));
    }

    RequestHead {
        method: parts.method.as_str().to_string(),
        uri: parts
            .uri
            .path_and_query()
            .map_or_else(|| "/".to_string(), |pq| pq.as_str().to_string()),
        route_key,
        headers,
    }
}

pub fn response_head(status: u16, headers: &HeaderMap) -> ResponseHead {
    ResponseHead {
        status,
        headers: to_wire(headers),
    }
}
