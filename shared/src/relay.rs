//! Filtered relay rules.
//!
//! A relay is a decision tree: a root rule with body and header predicates
//! plus ordered fallback rules of the same shape. The first rule whose
//! predicates all hold selects the destination.

use std::collections::BTreeMap;

use http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json_path::JsonPath;
use url::Url;

use crate::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilteredRelayConfig {
    pub destination_url: String,
    /// JSONPath into the request body; its (string) result feeds the body
    /// predicates below. Unset means the body always matches.
    #[serde(default)]
    pub json_path: Option<String>,
    #[serde(default)]
    pub equals: Vec<String>,
    #[serde(default)]
    pub has_prefix: Vec<String>,
    #[serde(default)]
    pub contains: Vec<String>,
    #[serde(default)]
    pub header_equals: BTreeMap<String, String>,
    #[serde(default)]
    pub header_not_equals: BTreeMap<String, String>,
    /// Fallback rules, tried in order when this rule misses.
    #[serde(default)]
    pub additional_configs: Vec<FilteredRelayConfig>,
    #[serde(default)]
    pub log_request_body: bool,
    #[serde(default)]
    pub log_request_headers: bool,
    #[serde(default)]
    pub log_response_body: bool,
    #[serde(default)]
    pub log_response_headers: bool,
}

impl FilteredRelayConfig {
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.destination_url)
            .map_err(|e| Error::Config(format!("destinationUrl '{}': {e}", self.destination_url)))?;
        if let Some(expr) = self.json_path.as_deref() {
            if !expr.is_empty() {
                JsonPath::parse(expr)
                    .map_err(|e| Error::Config(format!("jsonPath '{expr}': {e}")))?;
            }
        }
        for child in &self.additional_configs {
            child.validate()?;
        }
        Ok(())
    }

    /// Evaluate the body predicates. All specified predicate kinds must hold
    /// (and every entry within a kind) for a match.
    fn body_matches(&self, body: &Value) -> Result<bool> {
        let expr = match self.json_path.as_deref() {
            Some(expr) if !expr.is_empty() => expr,
            _ => return Ok(true),
        };

        let path = JsonPath::parse(expr)
            .map_err(|e| Error::RelayMatch(format!("invalid jsonpath '{expr}': {e}")))?;
        let nodes = path.query(body);

        let result = match nodes.len() {
            // A missing key evaluates like an empty string rather than an error.
            0 => "",
            1 => nodes
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| Error::RelayMatch("jsonpath result is not a string".into()))?,
            n => {
                return Err(Error::RelayMatch(format!(
                    "jsonpath '{expr}' matched {n} values"
                )))
            }
        };

        Ok(self.equals.iter().all(|v| result == v)
            && self.has_prefix.iter().all(|v| result.starts_with(v.as_str()))
            && self.contains.iter().all(|v| result.contains(v.as_str())))
    }

    fn headers_match(&self, headers: &HeaderMap) -> bool {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
        };

        self.header_equals.iter().all(|(k, v)| get(k) == v)
            && self.header_not_equals.iter().all(|(k, v)| get(k) != v)
    }

    /// Find the first rule in this tree whose predicates hold: this rule,
    /// else its fallbacks depth-first in order. Predicate evaluation errors
    /// abort the search.
    pub fn find_match<'a>(
        &'a self,
        headers: &HeaderMap,
        body: &Value,
    ) -> Result<(&'a FilteredRelayConfig, bool)> {
        if self.body_matches(body)? && self.headers_match(headers) {
            return Ok((self, true));
        }

        for child in &self.additional_configs {
            let (rule, matched) = child.find_match(headers, body)?;
            if matched {
                return Ok((rule, true));
            }
        }

        Ok((self, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderName, HeaderValue};
    use serde_json::json;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                k.parse::<HeaderName>().unwrap(),
                v.parse::<HeaderValue>().unwrap(),
            );
        }
        map
    }

    fn rule(destination: &str) -> FilteredRelayConfig {
        FilteredRelayConfig {
            destination_url: destination.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_rule_always_matches() {
        let r = rule("http://dest.example");
        let (selected, matched) = r.find_match(&headers(&[]), &json!({})).unwrap();
        assert!(matched);
        assert_eq!(selected.destination_url, "http://dest.example");
    }

    #[test]
    fn test_jsonpath_equals() {
        let r = FilteredRelayConfig {
            json_path: Some("$.foo".into()),
            equals: vec!["bar".into()],
            ..rule("http://dest.example")
        };

        let (_, matched) = r.find_match(&headers(&[]), &json!({"foo": "bar"})).unwrap();
        assert!(matched);

        let (_, matched) = r.find_match(&headers(&[]), &json!({"foo": "baz"})).unwrap();
        assert!(!matched);
    }

    #[test]
    fn test_missing_key_is_empty_string() {
        let r = FilteredRelayConfig {
            json_path: Some("$.foo".into()),
            equals: vec!["".into()],
            ..rule("http://dest.example")
        };

        let (_, matched) = r.find_match(&headers(&[]), &json!({"other": 1})).unwrap();
        assert!(matched);
    }

    #[test]
    fn test_non_string_result_is_an_error() {
        let r = FilteredRelayConfig {
            json_path: Some("$.foo".into()),
            equals: vec!["1".into()],
            ..rule("http://dest.example")
        };

        assert!(r.find_match(&headers(&[]), &json!({"foo": 1})).is_err());
    }

    #[test]
    fn test_conjunctive_body_and_header_predicates() {
        let r = FilteredRelayConfig {
            json_path: Some("$.foo".into()),
            equals: vec!["bar".into()],
            header_equals: BTreeMap::from([("X-Kind".to_string(), "Y".to_string())]),
            ..rule("http://dest.example")
        };

        let body = json!({"foo": "bar"});

        let (_, matched) = r.find_match(&headers(&[("X-Kind", "Y")]), &body).unwrap();
        assert!(matched);

        // Body-only or header-only is a miss.
        let (_, matched) = r.find_match(&headers(&[]), &body).unwrap();
        assert!(!matched);
        let (_, matched) = r
            .find_match(&headers(&[("X-Kind", "Y")]), &json!({"foo": "nope"}))
            .unwrap();
        assert!(!matched);
    }

    #[test]
    fn test_prefix_and_contains_conjunction() {
        let r = FilteredRelayConfig {
            json_path: Some("$.comment.body".into()),
            has_prefix: vec!["/semgrep".into()],
            contains: vec!["test".into()],
            ..rule("http://dest.example")
        };

        let (_, matched) = r
            .find_match(&headers(&[]), &json!({"comment": {"body": "/semgrep test"}}))
            .unwrap();
        assert!(matched);

        let (_, matched) = r
            .find_match(&headers(&[]), &json!({"comment": {"body": "/semgrep run"}}))
            .unwrap();
        assert!(!matched);
    }

    #[test]
    fn test_fallback_order_and_selection() {
        let root = FilteredRelayConfig {
            json_path: Some("$.comment.body".into()),
            contains: vec!["/semgrep".into()],
            header_equals: BTreeMap::from([(
                "X-GitHub-Event".to_string(),
                "pull_request_review_comment".to_string(),
            )]),
            additional_configs: vec![FilteredRelayConfig {
                header_not_equals: BTreeMap::from([(
                    "X-GitHub-Event".to_string(),
                    "pull_request_review_comment".to_string(),
                )]),
                ..rule("http://server2.example")
            }],
            ..rule("http://server1.example")
        };

        let event = headers(&[("X-GitHub-Event", "pull_request_review_comment")]);
        let other = headers(&[("X-GitHub-Event", "issue")]);

        // Root matches: review comment mentioning /semgrep.
        let (selected, matched) = root
            .find_match(&event, &json!({"comment": {"body": "/semgrep test"}}))
            .unwrap();
        assert!(matched);
        assert_eq!(selected.destination_url, "http://server1.example");

        // Any other event falls through to the fallback.
        let (selected, matched) = root.find_match(&other, &json!({"foo": "bar"})).unwrap();
        assert!(matched);
        assert_eq!(selected.destination_url, "http://server2.example");

        // Review comment without the mention matches nothing.
        let (_, matched) = root
            .find_match(&event, &json!({"comment": {"body": "hello"}}))
            .unwrap();
        assert!(!matched);
    }

    #[test]
    fn test_header_not_equals_on_missing_header() {
        let r = FilteredRelayConfig {
            header_not_equals: BTreeMap::from([("X-Kind".to_string(), "Y".to_string())]),
            ..rule("http://dest.example")
        };

        // A missing header reads as "" and so differs from "Y".
        let (_, matched) = r.find_match(&headers(&[]), &json!({})).unwrap();
        assert!(matched);

        let (_, matched) = r.find_match(&headers(&[("X-Kind", "Y")]), &json!({})).unwrap();
        assert!(!matched);
    }

    #[test]
    fn test_validate_rejects_bad_destination_and_path() {
        let mut r = rule("not a url");
        assert!(r.validate().is_err());

        r.destination_url = "http://dest.example".into();
        r.validate().unwrap();

        r.json_path = Some("$[".into());
        assert!(r.validate().is_err());
    }
}
