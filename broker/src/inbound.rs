//! Inbound reverse proxy.
//!
//! HTTP server bound inside the tunnel. `/proxy/{url}` requests are checked
//! against the allowlist, rewritten per the matching rule, and forwarded to
//! the local service. The proxy is percent-transparent: paths and queries
//! pass through byte-for-byte.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{middleware, Json, Router};
use tracing::{info, warn};
use url::Url;

use broker_shared::allowlist::Allowlist;
use broker_shared::config::{InboundProxyConfig, LoggingConfig};
use broker_shared::Result;

use crate::headers::{prepare_request_headers, prepare_response_headers};
use crate::http_client;
use crate::logging::{log_requests, RequestId, RequestLog};
use crate::metrics::Metrics;
use crate::netstack::VirtualNet;
use crate::server::{serve_virtual, ServerHandle};

pub const ERROR_RESPONSE_HEADER: &str = "x-semgrep-private-link-error";
pub const PROXY_RESPONSE_HEADER: &str = "x-semgrep-private-link";
pub const HEALTHCHECK_PATH: &str = "/healthcheck";
pub const METRICS_PATH: &str = "/metrics";
const PROXY_PREFIX: &str = "/proxy/";

#[derive(Clone)]
struct InboundState {
    allowlist: Arc<Allowlist>,
    logging: Arc<LoggingConfig>,
    client: reqwest::Client,
    metrics: Metrics,
}

/// Build the tunnel-side router. Split out from [`start`] so the proxy
/// semantics can be exercised without a tunnel.
pub fn build_router(
    allowlist: Allowlist,
    logging: LoggingConfig,
    client: reqwest::Client,
    metrics: Metrics,
) -> Router {
    let request_log = RequestLog::new(&logging.skip_paths, metrics.clone());
    let state = InboundState {
        allowlist: Arc::new(allowlist),
        logging: Arc::new(logging),
        client,
        metrics,
    };

    Router::new()
        .route(HEALTHCHECK_PATH, get(healthcheck))
        .route(METRICS_PATH, get(metrics_endpoint))
        .route("/proxy/{*destination}", any(proxy))
        .layer(middleware::from_fn_with_state(request_log, log_requests))
        .with_state(state)
}

/// Open the tunnel-side listener and serve the proxy on it.
pub async fn start(
    config: &InboundProxyConfig,
    net: &VirtualNet,
    metrics: Metrics,
) -> Result<ServerHandle> {
    let client = http_client::build_client(&config.http_client)?;
    let router = build_router(config.allowlist.clone(), config.logging.clone(), client, metrics);

    let listener = net.listen(config.proxy_listen_port).await?;

    info!(path = HEALTHCHECK_PATH, "healthcheck.configured");
    info!(path = METRICS_PATH, "metrics.configured");
    info!(port = config.proxy_listen_port, "broker.start");

    Ok(serve_virtual(
        listener,
        router,
        Duration::from_secs(config.graceful_shutdown_seconds),
    ))
}

async fn healthcheck() -> Json<&'static str> {
    Json("OK")
}

async fn metrics_endpoint(State(state): State<InboundState>) -> String {
    state.metrics.to_prometheus().await
}

async fn proxy(State(state): State<InboundState>, req: Request) -> Response {
    let req_id = req.extensions().get::<RequestId>().map(|id| id.0).unwrap_or(0);

    // Read the destination from the raw request path rather than the
    // router's capture: captures are percent-decoded, and an encoded `/`
    // must reach the upstream untouched.
    let raw_path = req.uri().path().to_string();
    let Some(raw_destination) = raw_path.strip_prefix(PROXY_PREFIX) else {
        return error_response(StatusCode::BAD_REQUEST, "missing destination url");
    };

    let mut destination = match Url::parse(raw_destination) {
        Ok(url) => url,
        Err(e) => {
            warn!(id = req_id, destination = raw_destination, error = %e, "proxy.destination_url_parse");
            return error_response(StatusCode::BAD_REQUEST, e.to_string());
        }
    };
    // The query string is carried over verbatim.
    destination.set_query(req.uri().query());

    let method = req.method().clone();
    let rule = match state.allowlist.find_match(method.as_str(), &destination) {
        Some(rule) => rule.clone(),
        None => {
            warn!(id = req_id, method = %method, destination = %destination, "allowlist.reject");
            state.metrics.record_allowlist_reject();
            return error_response(StatusCode::FORBIDDEN, "url is not in allowlist");
        }
    };

    let (parts, body) = req.into_parts();

    let mut request_headers = parts.headers.clone();
    prepare_request_headers(&mut request_headers, &rule.set_request_headers);

    let log_request_body = state.logging.log_request_body || rule.log_request_body;
    let log_request_headers = state.logging.log_request_headers || rule.log_request_headers;
    let logged_headers = log_request_headers.then(|| format!("{:?}", parts.headers));

    // Body logging requires buffering; otherwise the body streams through.
    let outbound_body = if log_request_body {
        let bytes = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(id = req_id, error = %e, "proxy.request_body_read");
                return error_response(StatusCode::BAD_REQUEST, e.to_string());
            }
        };
        info!(
            id = req_id,
            destination = %destination,
            allowlist_match = %rule.url,
            request_body = %String::from_utf8_lossy(&bytes),
            request_headers = ?logged_headers,
            "proxy.request"
        );
        reqwest::Body::from(bytes)
    } else {
        info!(
            id = req_id,
            destination = %destination,
            allowlist_match = %rule.url,
            request_headers = ?logged_headers,
            "proxy.request"
        );
        reqwest::Body::wrap_stream(body.into_data_stream())
    };

    let upstream = state
        .client
        .request(method, destination.clone())
        .headers(request_headers)
        .body(outbound_body)
        .send()
        .await;
    let upstream = match upstream {
        Ok(response) => response,
        Err(e) => {
            warn!(id = req_id, destination = %destination, error = %e, "proxy.upstream_error");
            return error_response(StatusCode::BAD_GATEWAY, e.to_string());
        }
    };

    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();
    prepare_response_headers(&mut response_headers, &rule.remove_response_headers);
    response_headers.insert(
        HeaderName::from_static(PROXY_RESPONSE_HEADER),
        HeaderValue::from_static("1"),
    );

    let log_response_body = state.logging.log_response_body || rule.log_response_body;
    let log_response_headers = state.logging.log_response_headers || rule.log_response_headers;
    let logged_response_headers = log_response_headers.then(|| format!("{response_headers:?}"));

    let body = if log_response_body {
        match upstream.bytes().await {
            Ok(bytes) => {
                info!(
                    id = req_id,
                    status = status.as_u16(),
                    response_body = %String::from_utf8_lossy(&bytes),
                    response_headers = ?logged_response_headers,
                    "proxy.response"
                );
                Body::from(bytes)
            }
            Err(e) => {
                warn!(id = req_id, error = %e, "proxy.response_body_read");
                return error_response(StatusCode::BAD_GATEWAY, e.to_string());
            }
        }
    } else {
        info!(
            id = req_id,
            status = status.as_u16(),
            response_headers = ?logged_response_headers,
            "proxy.response"
        );
        Body::from_stream(upstream.bytes_stream())
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let mut response = Json(serde_json::json!({"error": message.into()})).into_response();
    *response.status_mut() = status;
    response.headers_mut().insert(
        HeaderName::from_static(ERROR_RESPONSE_HEADER),
        HeaderValue::from_static("1"),
    );
    response
}
