//! Outbound relay server.
//!
//! Plain local HTTP server that inspects incoming webhooks and forwards the
//! ones matching a relay's predicate tree to that relay's destination. The
//! body is buffered once and replayed to both the matcher and the upstream.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{middleware, Json, Router};
use serde_json::{json, Value};
use tracing::{info, warn};
use url::Url;

use broker_shared::config::{HttpClientConfig, LoggingConfig, OutboundProxyConfig};
use broker_shared::relay::FilteredRelayConfig;
use broker_shared::Result;

use crate::headers::{prepare_request_headers, prepare_response_headers};
use crate::http_client;
use crate::inbound::{HEALTHCHECK_PATH, METRICS_PATH};
use crate::logging::{log_requests, RequestId, RequestLog};
use crate::metrics::Metrics;
use crate::server::{serve_tcp, ServerHandle};

pub const RELAY_MATCH_HEADER: &str = "x-semgrep-network-broker-relay-match";

#[derive(Clone)]
struct RelayState {
    relays: Arc<BTreeMap<String, FilteredRelayConfig>>,
    logging: Arc<LoggingConfig>,
    client: reqwest::Client,
    metrics: Metrics,
}

/// Build the relay router; split out from [`start`] for tests.
pub fn build_router(
    relays: BTreeMap<String, FilteredRelayConfig>,
    logging: LoggingConfig,
    client: reqwest::Client,
    metrics: Metrics,
) -> Router {
    let request_log = RequestLog::new(&logging.skip_paths, metrics.clone());
    let state = RelayState {
        relays: Arc::new(relays),
        logging: Arc::new(logging),
        client,
        metrics,
    };

    Router::new()
        .route(HEALTHCHECK_PATH, get(healthcheck))
        .route(METRICS_PATH, get(metrics_endpoint))
        .route("/relay/{name}", any(relay))
        .layer(middleware::from_fn_with_state(request_log, log_requests))
        .with_state(state)
}

/// Bind the relay listener and serve. Returns `None` when no relays are
/// configured.
pub async fn start(config: &OutboundProxyConfig, metrics: Metrics) -> Result<Option<ServerHandle>> {
    config.validate()?;

    if config.relay.is_empty() {
        warn!("relay.no_configs");
        return Ok(None);
    }

    for (name, relay) in &config.relay {
        let path = format!("/relay/{name}");
        info!(
            path = %path,
            destination_url = %relay.destination_url,
            json_path = ?relay.json_path,
            equals = ?relay.equals,
            has_prefix = ?relay.has_prefix,
            contains = ?relay.contains,
            "relay.configured"
        );
    }

    let client = http_client::build_client(&HttpClientConfig::default())?;
    let router = build_router(config.relay.clone(), config.logging.clone(), client, metrics);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.listen_port)).await?;
    info!(listen = %listener.local_addr()?, "relay.start");

    Ok(Some(serve_tcp(
        listener,
        router,
        Duration::from_secs(config.graceful_shutdown_seconds),
    )))
}

async fn healthcheck() -> Json<&'static str> {
    Json("OK")
}

async fn metrics_endpoint(State(state): State<RelayState>) -> String {
    state.metrics.to_prometheus().await
}

async fn relay(
    State(state): State<RelayState>,
    Path(name): Path<String>,
    req: Request,
) -> Response {
    let req_id = req.extensions().get::<RequestId>().map(|id| id.0).unwrap_or(0);

    let Some(relay) = state.relays.get(&name) else {
        warn!(id = req_id, relay = %name, "relay.not_found");
        return json_error(StatusCode::BAD_REQUEST, format!("no such relay: {name}"));
    };

    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(id = req_id, error = %e, "relay.body_read");
            return json_error(StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    // An unparseable body still allows header-only matches.
    let parsed = match parse_body_json(&bytes) {
        Ok(value) => value,
        Err(e) => {
            warn!(id = req_id, error = %e, "relay.parse_json");
            Value::Object(serde_json::Map::new())
        }
    };

    let (rule, matched) = match relay.find_match(&parts.headers, &parsed) {
        Ok(result) => result,
        Err(e) => {
            info!(id = req_id, error = %e, "relay.match_err");
            return json_error(StatusCode::BAD_REQUEST, format!("matching error: {e}"));
        }
    };

    let log_body = (state.logging.log_request_body || rule.log_request_body)
        .then(|| String::from_utf8_lossy(&bytes).into_owned());
    let log_headers = state
        .logging
        .log_request_headers
        .then(|| format!("{:?}", parts.headers));

    if !matched {
        state.metrics.record_relay(false);
        info!(
            id = req_id,
            request_body = ?log_body,
            request_headers = ?log_headers,
            "relay.no_match"
        );
        let mut response = Json(json!({"result": "no match"})).into_response();
        response.headers_mut().insert(
            HeaderName::from_static(RELAY_MATCH_HEADER),
            HeaderValue::from_static("0"),
        );
        return response;
    }
    state.metrics.record_relay(true);

    let destination = match Url::parse(&rule.destination_url) {
        Ok(url) => url,
        Err(e) => {
            warn!(id = req_id, destination = %rule.destination_url, error = %e, "relay.destination_url_parse");
            return json_error(StatusCode::BAD_REQUEST, format!("url parser error: {e}"));
        }
    };

    info!(
        id = req_id,
        destination = %destination,
        request_body = ?log_body,
        request_headers = ?log_headers,
        "relay.proxy_request"
    );

    let mut request_headers = parts.headers.clone();
    prepare_request_headers(&mut request_headers, &BTreeMap::new());

    let upstream = state
        .client
        .request(parts.method.clone(), destination)
        .headers(request_headers)
        .body(reqwest::Body::from(bytes.clone()))
        .send()
        .await;
    let upstream = match upstream {
        Ok(response) => response,
        Err(e) => {
            warn!(id = req_id, error = %e, "relay.upstream_error");
            let mut response =
                json_error(StatusCode::BAD_GATEWAY, e.to_string());
            response.headers_mut().insert(
                HeaderName::from_static(RELAY_MATCH_HEADER),
                HeaderValue::from_static("1"),
            );
            return response;
        }
    };

    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();
    prepare_response_headers(&mut response_headers, &[]);
    response_headers.insert(
        HeaderName::from_static(RELAY_MATCH_HEADER),
        HeaderValue::from_static("1"),
    );

    let log_response_body = state.logging.log_response_body || rule.log_response_body;
    let log_response_headers = (state.logging.log_response_headers || rule.log_response_headers)
        .then(|| format!("{response_headers:?}"));

    let body = if log_response_body {
        match upstream.bytes().await {
            Ok(bytes) => {
                info!(
                    id = req_id,
                    status = status.as_u16(),
                    response_body = %String::from_utf8_lossy(&bytes),
                    response_headers = ?log_response_headers,
                    "relay.proxy_response"
                );
                Body::from(bytes)
            }
            Err(e) => {
                warn!(id = req_id, error = %e, "relay.response_body_read");
                return json_error(StatusCode::BAD_GATEWAY, e.to_string());
            }
        }
    } else {
        info!(
            id = req_id,
            status = status.as_u16(),
            response_headers = ?log_response_headers,
            "relay.proxy_response"
        );
        Body::from_stream(upstream.bytes_stream())
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}

/// Parse the buffered webhook body. An empty body is an empty object.
fn parse_body_json(bytes: &[u8]) -> std::result::Result<Value, serde_json::Error> {
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    serde_json::from_slice(bytes)
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    let mut response = Json(json!({"error": message.into()})).into_response();
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_body_json_empty_is_object() {
        assert_eq!(
            parse_body_json(b"").unwrap(),
            Value::Object(serde_json::Map::new())
        );
        assert_eq!(
            parse_body_json(b"  \n").unwrap(),
            Value::Object(serde_json::Map::new())
        );
    }

    #[test]
    fn test_parse_body_json_object() {
        let value = parse_body_json(br#"{"foo": "bar"}"#).unwrap();
        assert_eq!(value["foo"], "bar");
    }

    #[test]
    fn test_parse_body_json_malformed() {
        assert!(parse_body_json(b"{not json").is_err());
    }
}
