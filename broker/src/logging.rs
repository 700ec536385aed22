//! Request logging middleware.
//!
//! Stamps every response with a per-server request ID, logs request
//! start/finish events, and feeds the latency metrics.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::header::{HeaderName, HeaderValue, USER_AGENT};
use axum::middleware::Next;
use axum::response::Response;
use tracing::info;

use crate::metrics::Metrics;

pub const REQUEST_ID_HEADER: &str = "x-semgrep-network-broker-req-id";

/// Monotonic request ID, stashed in request extensions for handlers to log.
#[derive(Debug, Clone, Copy)]
pub struct RequestId(pub u64);

#[derive(Clone)]
pub struct RequestLog {
    counter: Arc<AtomicU64>,
    skip_paths: Arc<HashSet<String>>,
    metrics: Metrics,
}

impl RequestLog {
    pub fn new(skip_paths: &[String], metrics: Metrics) -> Self {
        Self {
            counter: Arc::new(AtomicU64::new(0)),
            skip_paths: Arc::new(skip_paths.iter().cloned().collect()),
            metrics,
        }
    }
}

pub async fn log_requests(State(log): State<RequestLog>, mut req: Request, next: Next) -> Response {
    let start = Instant::now();
    let id = log.counter.fetch_add(1, Ordering::Relaxed) + 1;

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let user_agent = req
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    req.extensions_mut().insert(RequestId(id));

    let skip = log.skip_paths.contains(&path);
    if !skip {
        info!(id, method = %method, path = %path, query = %query, user_agent = %user_agent, "request.start");
    }

    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }

    let status = response.status().as_u16();
    let latency = start.elapsed();
    log.metrics.record_request(status, latency.as_micros() as u64).await;

    if !skip {
        info!(id, status, latency_ms = latency.as_millis() as u64, "request.response");
    }

    response
}
