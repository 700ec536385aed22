//! Proxy header rewriting.
//!
//! Hop-by-hop stripping and the per-rule request/response rewrites applied
//! by both proxy servers.

use std::collections::BTreeMap;

use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST};
use http::HeaderMap;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including any named by the Connection header.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let connection_named: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    for name in connection_named {
        headers.remove(name.as_str());
    }
}

/// Prepare inbound request headers for the upstream leg: drop hop-by-hop
/// and host/length bookkeeping (the client recomputes those from the
/// rewritten URL and body), then apply per-rule overrides.
pub fn prepare_request_headers(headers: &mut HeaderMap, overrides: &BTreeMap<String, String>) {
    strip_hop_by_hop(headers);
    headers.remove(HOST);
    headers.remove(CONTENT_LENGTH);

    for (name, value) in overrides {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            continue;
        };
        headers.insert(name, value);
    }
}

/// Prepare upstream response headers for the client leg.
pub fn prepare_response_headers(headers: &mut HeaderMap, remove: &[String]) {
    strip_hop_by_hop(headers);
    for name in remove {
        headers.remove(name.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                k.parse::<HeaderName>().unwrap(),
                v.parse::<HeaderValue>().unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = header_map(&[
            ("Connection", "keep-alive, X-Conn-Scoped"),
            ("Keep-Alive", "timeout=5"),
            ("X-Conn-Scoped", "gone"),
            ("X-Kept", "yes"),
        ]);
        strip_hop_by_hop(&mut headers);

        assert!(headers.get("connection").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("x-conn-scoped").is_none());
        assert_eq!(headers.get("x-kept").unwrap(), "yes");
    }

    #[test]
    fn test_request_overrides_replace_inbound_values() {
        let mut headers = header_map(&[("Host", "orig.example"), ("X-Token", "client-supplied")]);
        let overrides = BTreeMap::from([("X-Token".to_string(), "rule-supplied".to_string())]);
        prepare_request_headers(&mut headers, &overrides);

        assert!(headers.get("host").is_none());
        assert_eq!(headers.get("x-token").unwrap(), "rule-supplied");
    }

    #[test]
    fn test_response_removals() {
        let mut headers = header_map(&[("X-Internal", "secret"), ("Content-Type", "text/plain")]);
        prepare_response_headers(&mut headers, &["X-Internal".to_string()]);

        assert!(headers.get("x-internal").is_none());
        assert_eq!(headers.get("content-type").unwrap(), "text/plain");
    }
}
