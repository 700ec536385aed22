//! Relay dispatch semantics against real upstream servers.

use std::collections::BTreeMap;

use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::any;
use axum::Router;
use tower::ServiceExt;

use broker_shared::config::LoggingConfig;
use broker_shared::relay::FilteredRelayConfig;
use semgrep_network_broker::metrics::Metrics;
use semgrep_network_broker::relay_server;

/// Upstream answering every request with a fixed label.
async fn spawn_static_upstream(label: &'static str) -> String {
    let app = Router::new().fallback(any(move || async move { label }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Upstream echoing the request body back.
async fn spawn_echo_upstream() -> String {
    let app = Router::new().fallback(any(|req: Request| async move {
        axum::body::to_bytes(req.into_body(), usize::MAX).await.unwrap()
    }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn relay_router(relays: BTreeMap<String, FilteredRelayConfig>) -> Router {
    relay_server::build_router(
        relays,
        LoggingConfig::default(),
        reqwest::Client::new(),
        Metrics::new(),
    )
}

async fn send(
    router: &Router,
    uri: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> (StatusCode, HeaderMap, Bytes) {
    let mut request = axum::http::Request::builder().method("POST").uri(uri);
    for (name, value) in headers {
        request = request.header(*name, *value);
    }
    let request = request.body(Body::from(body.to_string())).unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, bytes)
}

#[tokio::test]
async fn test_unknown_relay_name() {
    let router = relay_router(BTreeMap::new());
    let (status, _, bytes) = send(&router, "/relay/nope", &[], "{}").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(String::from_utf8_lossy(&bytes).contains("no such relay"));
}

#[tokio::test]
async fn test_unconditional_relay_forwards() {
    let server = spawn_static_upstream("Server1").await;
    let relays = BTreeMap::from([(
        "always-succeed".to_string(),
        FilteredRelayConfig {
            destination_url: server,
            ..Default::default()
        },
    )]);
    let router = relay_router(relays);

    let (status, headers, bytes) = send(&router, "/relay/always-succeed", &[], "{}").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("x-semgrep-network-broker-relay-match").unwrap(), "1");
    assert_eq!(bytes.as_ref(), b"Server1");
}

#[tokio::test]
async fn test_jsonpath_equals_match_and_miss() {
    let server = spawn_static_upstream("Server1").await;
    let relays = BTreeMap::from([(
        "post-jsonpath-foo-bar".to_string(),
        FilteredRelayConfig {
            destination_url: server,
            json_path: Some("$.foo".to_string()),
            equals: vec!["bar".to_string()],
            ..Default::default()
        },
    )]);
    let router = relay_router(relays);

    let (status, headers, bytes) =
        send(&router, "/relay/post-jsonpath-foo-bar", &[], r#"{"foo":"bar"}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("x-semgrep-network-broker-relay-match").unwrap(), "1");
    assert_eq!(bytes.as_ref(), b"Server1");

    let (status, headers, bytes) =
        send(&router, "/relay/post-jsonpath-foo-bar", &[], r#"{"foo":"baz"}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("x-semgrep-network-broker-relay-match").unwrap(), "0");
    assert!(String::from_utf8_lossy(&bytes).contains("no match"));
}

#[tokio::test]
async fn test_fallback_routing() {
    let server1 = spawn_static_upstream("Server1").await;
    let server2 = spawn_static_upstream("Server2").await;

    let relays = BTreeMap::from([(
        "github-pr-comment-with-fallback".to_string(),
        FilteredRelayConfig {
            destination_url: server1,
            json_path: Some("$.comment.body".to_string()),
            contains: vec!["/semgrep".to_string()],
            header_equals: BTreeMap::from([(
                "X-GitHub-Event".to_string(),
                "pull_request_review_comment".to_string(),
            )]),
            additional_configs: vec![FilteredRelayConfig {
                destination_url: server2,
                header_not_equals: BTreeMap::from([(
                    "X-GitHub-Event".to_string(),
                    "pull_request_review_comment".to_string(),
                )]),
                ..Default::default()
            }],
            ..Default::default()
        },
    )]);
    let router = relay_router(relays);
    let uri = "/relay/github-pr-comment-with-fallback";
    let review_comment = [("X-GitHub-Event", "pull_request_review_comment")];

    // A review comment mentioning /semgrep goes to the primary.
    let (status, headers, bytes) = send(
        &router,
        uri,
        &review_comment,
        r#"{"comment":{"body":"/semgrep test"}}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("x-semgrep-network-broker-relay-match").unwrap(), "1");
    assert_eq!(bytes.as_ref(), b"Server1");

    // Any other event type falls through to the fallback.
    let (status, headers, bytes) = send(
        &router,
        uri,
        &[("X-GitHub-Event", "issue")],
        r#"{"foo":"bar"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("x-semgrep-network-broker-relay-match").unwrap(), "1");
    assert_eq!(bytes.as_ref(), b"Server2");

    // A review comment without the mention matches nothing.
    let (status, headers, bytes) = send(
        &router,
        uri,
        &review_comment,
        r#"{"comment":{"body":"hello"}}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("x-semgrep-network-broker-relay-match").unwrap(), "0");
    assert!(String::from_utf8_lossy(&bytes).contains("no match"));
}

#[tokio::test]
async fn test_malformed_body_still_matches_headers() {
    let server = spawn_static_upstream("Server1").await;
    let relays = BTreeMap::from([(
        "header-only".to_string(),
        FilteredRelayConfig {
            destination_url: server,
            header_equals: BTreeMap::from([("X-Kind".to_string(), "ping".to_string())]),
            ..Default::default()
        },
    )]);
    let router = relay_router(relays);

    let (status, headers, _) =
        send(&router, "/relay/header-only", &[("X-Kind", "ping")], "{not json").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("x-semgrep-network-broker-relay-match").unwrap(), "1");
}

#[tokio::test]
async fn test_body_survives_match_and_proxy() {
    let echo = spawn_echo_upstream().await;
    let relays = BTreeMap::from([(
        "echo".to_string(),
        FilteredRelayConfig {
            destination_url: echo,
            json_path: Some("$.foo".to_string()),
            equals: vec!["bar".to_string()],
            ..Default::default()
        },
    )]);
    let router = relay_router(relays);

    let body = r#"{"foo":"bar","payload":[1,2,3]}"#;
    let (status, _, bytes) = send(&router, "/relay/echo", &[], body).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes.as_ref(), body.as_bytes());
}

#[tokio::test]
async fn test_match_error_is_bad_request() {
    let server = spawn_static_upstream("Server1").await;
    let relays = BTreeMap::from([(
        "non-string".to_string(),
        FilteredRelayConfig {
            destination_url: server,
            json_path: Some("$.foo".to_string()),
            equals: vec!["1".to_string()],
            ..Default::default()
        },
    )]);
    let router = relay_router(relays);

    // $.foo resolves to a number, which the matcher cannot compare.
    let (status, _, bytes) = send(&router, "/relay/non-string", &[], r#"{"foo":1}"#).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(String::from_utf8_lossy(&bytes).contains("matching error"));
}
