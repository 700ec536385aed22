//! Inbound request allowlist.
//!
//! Ordered URL-pattern rules with per-rule method sets and header rewrite
//! policy. Matching is scheme- and host-strict; paths are compared in their
//! percent-encoded form so an encoded `/` never splits a segment.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::{HttpMethod, HttpMethods};
use crate::{Error, Result};

/// One allowlist rule: a URL pattern, the methods it admits, and how the
/// proxied request/response get rewritten.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowlistItem {
    /// `scheme://host/path` where path segments may be literals, `:name`
    /// variables, or a trailing `*` matching one or more segments.
    pub url: String,
    #[serde(default)]
    pub methods: HttpMethods,
    #[serde(default)]
    pub set_request_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub remove_response_headers: Vec<String>,
    #[serde(default)]
    pub log_request_body: bool,
    #[serde(default)]
    pub log_request_headers: bool,
    #[serde(default)]
    pub log_response_body: bool,
    #[serde(default)]
    pub log_response_headers: bool,
}

impl AllowlistItem {
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.url)
            .map_err(|e| Error::Config(format!("allowlist url '{}': {e}", self.url)))?;
        Ok(())
    }

    /// Whether this rule admits `method` on `url`.
    pub fn matches(&self, method: HttpMethod, url: &Url) -> bool {
        if !self.methods.contains(method) {
            return false;
        }

        let Ok(pattern) = Url::parse(&self.url) else {
            return false;
        };

        // Scheme is case-normalized by the URL parser but still compared
        // strictly: http and https are different rules.
        if pattern.scheme() != url.scheme() {
            return false;
        }
        if pattern.host_str() != url.host_str() {
            return false;
        }
        if pattern.port_or_known_default() != url.port_or_known_default() {
            return false;
        }

        path_matches(pattern.path(), url.path())
    }
}

/// Match a pattern path against a request path, both percent-encoded.
fn path_matches(pattern: &str, path: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split('/').collect();
    let path_segments: Vec<&str> = path.split('/').collect();

    for (i, segment) in pattern_segments.iter().enumerate() {
        if *segment == "*" && i == pattern_segments.len() - 1 {
            // Trailing wildcard: one or more non-empty remaining segments.
            return path_segments.len() > i && path_segments[i..].iter().any(|s| !s.is_empty());
        }

        match path_segments.get(i) {
            None => return false,
            Some(got) => {
                if let Some(stripped) = segment.strip_prefix(':') {
                    if stripped.is_empty() || got.is_empty() {
                        return false;
                    }
                } else if segment != got {
                    return false;
                }
            }
        }
    }

    pattern_segments.len() == path_segments.len()
}

/// Ordered rule list; lookup is first-match in insertion order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Allowlist(pub Vec<AllowlistItem>);

impl Allowlist {
    /// First rule admitting `method` on `url`, if any.
    pub fn find_match(&self, method: &str, url: &Url) -> Option<&AllowlistItem> {
        let method = HttpMethod::parse(method);
        if method == HttpMethod::Unknown {
            return None;
        }
        self.0.iter().find(|item| item.matches(method, url))
    }
}

impl Deref for Allowlist {
    type Target = Vec<AllowlistItem>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Allowlist {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(url: &str, methods: &[&str]) -> AllowlistItem {
        AllowlistItem {
            url: url.to_string(),
            methods: HttpMethods::parse(methods),
            ..Default::default()
        }
    }

    fn assert_match(allowlist: &Allowlist, method: &str, raw_url: &str, should_match: bool) {
        let url = Url::parse(raw_url).unwrap();
        let matched = allowlist.find_match(method, &url).is_some();
        assert_eq!(
            matched, should_match,
            "{method} {raw_url} match result was {matched}, expected {should_match}"
        );
    }

    #[test]
    fn test_method_match() {
        let allowlist = Allowlist(vec![
            item("https://foo.com/get-only", &["GET"]),
            item("https://foo.com/post-only", &["POST"]),
            item("https://foo.com/get-or-post", &["GET", "POST"]),
        ]);

        assert_match(&allowlist, "GET", "https://foo.com/get-only", true);
        assert_match(&allowlist, "POST", "https://foo.com/get-only", false);
        assert_match(&allowlist, "DELETE", "https://foo.com/get-only", false);

        assert_match(&allowlist, "GET", "https://foo.com/post-only", false);
        assert_match(&allowlist, "POST", "https://foo.com/post-only", true);
        assert_match(&allowlist, "DELETE", "https://foo.com/post-only", false);

        assert_match(&allowlist, "GET", "https://foo.com/get-or-post", true);
        assert_match(&allowlist, "POST", "https://foo.com/get-or-post", true);
        assert_match(&allowlist, "DELETE", "https://foo.com/get-or-post", false);
    }

    #[test]
    fn test_domain_match() {
        let allowlist = Allowlist(vec![
            item("https://foo.com/*", &["GET"]),
            item("https://bar.com/*", &["GET"]),
        ]);

        assert_match(&allowlist, "GET", "https://foo.com/get-only", true);
        assert_match(&allowlist, "GET", "https://bar.com/bar-only", true);
        assert_match(&allowlist, "GET", "https://baz.com/baz", false);
    }

    #[test]
    fn test_path_match() {
        let allowlist = Allowlist(vec![
            item("https://foo.com/hardcoded-path", &["GET"]),
            item("https://foo.com/wildcard-path/*", &["GET"]),
            item("https://foo.com/variable-path/:variable", &["GET"]),
        ]);

        assert_match(&allowlist, "GET", "https://foo.com/wildcard-path/a", true);
        assert_match(&allowlist, "GET", "https://foo.com/wildcard-path/a/b", true);
        assert_match(&allowlist, "GET", "https://foo.com/variable-path/a", true);
        assert_match(&allowlist, "GET", "https://foo.com/variable-path/a/b", false);
        assert_match(&allowlist, "GET", "https://foo.com/hardcoded-path", true);
        assert_match(&allowlist, "GET", "https://foo.com/hardcoded-path/bla", false);
    }

    #[test]
    fn test_wildcard_needs_at_least_one_segment() {
        let allowlist = Allowlist(vec![item("https://foo.com/a/*", &["GET"])]);

        assert_match(&allowlist, "GET", "https://foo.com/a", false);
        assert_match(&allowlist, "GET", "https://foo.com/a/", false);
        assert_match(&allowlist, "GET", "https://foo.com/a/b", true);
        assert_match(&allowlist, "GET", "https://foo.com/a/b/c", true);
    }

    #[test]
    fn test_scheme_and_host_strict() {
        let allowlist = Allowlist(vec![item("https://h/p", &["GET"])]);

        assert_match(&allowlist, "GET", "https://h/p", true);
        assert_match(&allowlist, "GET", "http://h/p", false);
        assert_match(&allowlist, "GET", "https://h2/p", false);
        // Host comparison is case-insensitive.
        assert_match(&allowlist, "GET", "https://H/p", true);
    }

    #[test]
    fn test_port_strict() {
        let allowlist = Allowlist(vec![item("http://local:3000/x", &["GET"])]);

        assert_match(&allowlist, "GET", "http://local:3000/x", true);
        assert_match(&allowlist, "GET", "http://local:3001/x", false);
        // Default ports are equivalent to omitted ones.
        let default_port = Allowlist(vec![item("http://local/x", &["GET"])]);
        assert_match(&default_port, "GET", "http://local:80/x", true);
    }

    #[test]
    fn test_encoded_slash_stays_one_segment() {
        let allowlist = Allowlist(vec![item("http://local/allowed-path/:v", &["POST"])]);

        assert_match(
            &allowlist,
            "POST",
            "http://local/allowed-path/foobar%2Fbla",
            true,
        );
        assert_match(&allowlist, "POST", "http://local/allowed-path/foo/bla", false);
    }

    #[test]
    fn test_unknown_method_rejected() {
        let allowlist = Allowlist(vec![item("https://foo.com/*", &["GET"])]);
        assert_match(&allowlist, "BREW", "https://foo.com/anything", false);
    }
}
