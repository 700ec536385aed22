//! Inbound proxy semantics, exercised against a real local upstream.
//!
//! The router under test is the same one served inside the tunnel; driving
//! it directly keeps these tests independent of WireGuard.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower::ServiceExt;

use broker_shared::allowlist::{Allowlist, AllowlistItem};
use broker_shared::config::{HttpMethods, LoggingConfig};
use semgrep_network_broker::inbound;
use semgrep_network_broker::metrics::Metrics;

async fn upstream_handler(State(hits): State<Arc<AtomicUsize>>, req: Request) -> Response {
    hits.fetch_add(1, Ordering::SeqCst);

    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let injected = req
        .headers()
        .get("x-injected")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let body = axum::body::to_bytes(req.into_body(), usize::MAX).await.unwrap();

    let mut response = Json(json!({
        "path": path,
        "query": query,
        "injected": injected,
        "body": String::from_utf8_lossy(&body),
    }))
    .into_response();
    response
        .headers_mut()
        .insert("x-upstream-secret", HeaderValue::from_static("s3cret"));
    response
}

/// Local service the broker proxies to. Returns its base URL and a hit
/// counter so tests can assert no connection was opened on rejection.
async fn spawn_upstream() -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .fallback(upstream_handler)
        .with_state(hits.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), hits)
}

fn rule(url: &str, methods: &[&str]) -> AllowlistItem {
    AllowlistItem {
        url: url.to_string(),
        methods: HttpMethods::parse(methods),
        ..Default::default()
    }
}

fn proxy_router(allowlist: Allowlist) -> Router {
    inbound::build_router(
        allowlist,
        LoggingConfig::default(),
        reqwest::Client::new(),
        Metrics::new(),
    )
}

async fn send(router: &Router, method: &str, uri: &str, body: &str) -> (StatusCode, HeaderMap, Bytes) {
    let request = axum::http::Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();

    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, bytes)
}

fn body_json(bytes: &Bytes) -> Value {
    serde_json::from_slice(bytes).unwrap()
}

#[tokio::test]
async fn test_healthcheck() {
    let router = proxy_router(Allowlist::default());
    let (status, headers, bytes) = send(&router, "GET", "/healthcheck", "").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes.as_ref(), b"\"OK\"");
    assert!(headers.contains_key("x-semgrep-network-broker-req-id"));
}

#[tokio::test]
async fn test_allowlisted_get_is_proxied() {
    let (base, hits) = spawn_upstream().await;
    let router = proxy_router(Allowlist(vec![rule(&format!("{base}/allowed-get"), &["GET"])]));

    let (status, headers, bytes) = send(&router, "GET", &format!("/proxy/{base}/allowed-get"), "").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("x-semgrep-private-link").unwrap(), "1");
    assert!(headers.contains_key("x-semgrep-network-broker-req-id"));
    assert_eq!(body_json(&bytes)["path"], "/allowed-get");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_method_denied() {
    let (base, hits) = spawn_upstream().await;
    let router = proxy_router(Allowlist(vec![rule(&format!("{base}/allowed-get"), &["GET"])]));

    let (status, headers, _) =
        send(&router, "POST", &format!("/proxy/{base}/allowed-get"), "{}").await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(headers.get("x-semgrep-private-link-error").unwrap(), "1");
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unlisted_url_never_reaches_upstream() {
    let (base, hits) = spawn_upstream().await;
    let router = proxy_router(Allowlist(vec![rule(&format!("{base}/allowed-get"), &["GET"])]));

    let (status, headers, _) = send(&router, "GET", &format!("/proxy/{base}/other"), "").await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(headers.get("x-semgrep-private-link-error").unwrap(), "1");
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_percent_encoded_path_forwarded_verbatim() {
    let (base, _) = spawn_upstream().await;
    let router = proxy_router(Allowlist(vec![rule(
        &format!("{base}/allowed-path/:v"),
        &["POST"],
    )]));

    let (status, _, bytes) = send(
        &router,
        "POST",
        &format!("/proxy/{base}/allowed-path/foobar%2Fbla"),
        "{}",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    // The encoded slash must reach the upstream byte-for-byte.
    assert_eq!(body_json(&bytes)["path"], "/allowed-path/foobar%2Fbla");
}

#[tokio::test]
async fn test_query_preserved_verbatim() {
    let (base, _) = spawn_upstream().await;
    let router = proxy_router(Allowlist(vec![rule(&format!("{base}/allowed-get"), &["GET"])]));

    let (status, _, bytes) = send(
        &router,
        "GET",
        &format!("/proxy/{base}/allowed-get?foo=b%2Far&baz=1"),
        "",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body_json(&bytes)["query"], "foo=b%2Far&baz=1");
}

#[tokio::test]
async fn test_header_rewrites() {
    let (base, _) = spawn_upstream().await;
    let mut item = rule(&format!("{base}/allowed-get"), &["GET"]);
    item.set_request_headers
        .insert("X-Injected".to_string(), "from-rule".to_string());
    item.remove_response_headers.push("X-Upstream-Secret".to_string());
    let router = proxy_router(Allowlist(vec![item]));

    let (status, headers, bytes) = send(&router, "GET", &format!("/proxy/{base}/allowed-get"), "").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body_json(&bytes)["injected"], "from-rule");
    assert!(headers.get("x-upstream-secret").is_none());
    assert_eq!(headers.get("x-semgrep-private-link").unwrap(), "1");
}

#[tokio::test]
async fn test_request_body_reaches_upstream() {
    let (base, _) = spawn_upstream().await;
    let router = proxy_router(Allowlist(vec![rule(&format!("{base}/allowed-post"), &["POST"])]));

    let (status, _, bytes) = send(
        &router,
        "POST",
        &format!("/proxy/{base}/allowed-post"),
        r#"{"hello":"world"}"#,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body_json(&bytes)["body"], r#"{"hello":"world"}"#);
}

#[tokio::test]
async fn test_unparseable_destination() {
    let router = proxy_router(Allowlist::default());
    let (status, headers, _) = send(&router, "GET", "/proxy/not-a-url", "").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(headers.get("x-semgrep-private-link-error").unwrap(), "1");
}

#[tokio::test]
async fn test_upstream_connect_failure_is_502() {
    // Point the allowlist at a port nothing listens on.
    let router = proxy_router(Allowlist(vec![rule("http://127.0.0.1:9/allowed-get", &["GET"])]));

    let (status, headers, _) =
        send(&router, "GET", "/proxy/http://127.0.0.1:9/allowed-get", "").await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(headers.get("x-semgrep-private-link-error").unwrap(), "1");
}
