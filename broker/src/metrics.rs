//! Broker metrics.
//!
//! Atomic counters plus a latency ring buffer, exposed in Prometheus text
//! format on each server's `/metrics` route.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

/// Per-server metrics. Cloning shares the underlying counters.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    requests_total: AtomicU64,
    status_2xx: AtomicU64,
    status_3xx: AtomicU64,
    status_4xx: AtomicU64,
    status_5xx: AtomicU64,
    allowlist_rejects: AtomicU64,
    relay_matches: AtomicU64,
    relay_no_matches: AtomicU64,
    heartbeat_failures: AtomicU64,
    latencies: Mutex<LatencyHistogram>,
}

/// Ring buffer of recent request latencies for percentile estimates.
struct LatencyHistogram {
    values: Vec<u64>,
    pos: usize,
    count: u64,
    sum: u64,
}

impl LatencyHistogram {
    fn new(capacity: usize) -> Self {
        Self {
            values: vec![0; capacity],
            pos: 0,
            count: 0,
            sum: 0,
        }
    }

    fn record(&mut self, latency_us: u64) {
        self.values[self.pos] = latency_us;
        self.pos = (self.pos + 1) % self.values.len();
        self.count += 1;
        self.sum += latency_us;
    }

    fn percentile(&self, p: f64) -> u64 {
        let count = self.count.min(self.values.len() as u64) as usize;
        if count == 0 {
            return 0;
        }

        let mut sorted: Vec<u64> = self.values[..count].to_vec();
        sorted.sort_unstable();

        let idx = ((count as f64 * p / 100.0) as usize).min(count - 1);
        sorted[idx]
    }

    fn average(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.sum / self.count
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                requests_total: AtomicU64::new(0),
                status_2xx: AtomicU64::new(0),
                status_3xx: AtomicU64::new(0),
                status_4xx: AtomicU64::new(0),
                status_5xx: AtomicU64::new(0),
                allowlist_rejects: AtomicU64::new(0),
                relay_matches: AtomicU64::new(0),
                relay_no_matches: AtomicU64::new(0),
                heartbeat_failures: AtomicU64::new(0),
                latencies: Mutex::new(LatencyHistogram::new(10000)),
            }),
        }
    }

    /// Record a completed request.
    pub async fn record_request(&self, status: u16, latency_us: u64) {
        self.inner.requests_total.fetch_add(1, Ordering::Relaxed);
        match status / 100 {
            2 => self.inner.status_2xx.fetch_add(1, Ordering::Relaxed),
            3 => self.inner.status_3xx.fetch_add(1, Ordering::Relaxed),
            4 => self.inner.status_4xx.fetch_add(1, Ordering::Relaxed),
            5 => self.inner.status_5xx.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
        self.inner.latencies.lock().await.record(latency_us);
    }

    pub fn record_allowlist_reject(&self) {
        self.inner.allowlist_rejects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relay(&self, matched: bool) {
        if matched {
            self.inner.relay_matches.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.relay_no_matches.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_heartbeat_failure(&self) {
        self.inner.heartbeat_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Render the Prometheus exposition text.
    pub async fn to_prometheus(&self) -> String {
        let lat = self.inner.latencies.lock().await;
        let p50 = lat.percentile(50.0);
        let p95 = lat.percentile(95.0);
        let p99 = lat.percentile(99.0);
        let avg = lat.average();
        drop(lat);

        format!(
            r#"# HELP broker_requests_total Total number of requests processed
# TYPE broker_requests_total counter
broker_requests_total {}

# HELP broker_requests_by_status Requests by HTTP status class
# TYPE broker_requests_by_status counter
broker_requests_by_status{{status="2xx"}} {}
broker_requests_by_status{{status="3xx"}} {}
broker_requests_by_status{{status="4xx"}} {}
broker_requests_by_status{{status="5xx"}} {}

# HELP broker_allowlist_rejects_total Requests rejected by the allowlist
# TYPE broker_allowlist_rejects_total counter
broker_allowlist_rejects_total {}

# HELP broker_relay_requests_total Relay requests by match result
# TYPE broker_relay_requests_total counter
broker_relay_requests_total{{result="match"}} {}
broker_relay_requests_total{{result="no_match"}} {}

# HELP broker_heartbeat_failures_total Failed heartbeat probes
# TYPE broker_heartbeat_failures_total counter
broker_heartbeat_failures_total {}

# HELP broker_latency_us Request latency in microseconds
# TYPE broker_latency_us summary
broker_latency_us{{quantile="0.5"}} {}
broker_latency_us{{quantile="0.95"}} {}
broker_latency_us{{quantile="0.99"}} {}
broker_latency_us_avg {}
"#,
            self.inner.requests_total.load(Ordering::Relaxed),
            self.inner.status_2xx.load(Ordering::Relaxed),
            self.inner.status_3xx.load(Ordering::Relaxed),
            self.inner.status_4xx.load(Ordering::Relaxed),
            self.inner.status_5xx.load(Ordering::Relaxed),
            self.inner.allowlist_rejects.load(Ordering::Relaxed),
            self.inner.relay_matches.load(Ordering::Relaxed),
            self.inner.relay_no_matches.load(Ordering::Relaxed),
            self.inner.heartbeat_failures.load(Ordering::Relaxed),
            p50,
            p95,
            p99,
            avg,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters_land_in_exposition() {
        let metrics = Metrics::new();
        metrics.record_request(200, 1500).await;
        metrics.record_request(403, 80).await;
        metrics.record_allowlist_reject();
        metrics.record_relay(true);
        metrics.record_relay(false);
        metrics.record_heartbeat_failure();

        let text = metrics.to_prometheus().await;
        assert!(text.contains("broker_requests_total 2"));
        assert!(text.contains(r#"broker_requests_by_status{status="2xx"} 1"#));
        assert!(text.contains(r#"broker_requests_by_status{status="4xx"} 1"#));
        assert!(text.contains("broker_allowlist_rejects_total 1"));
        assert!(text.contains(r#"broker_relay_requests_total{result="match"} 1"#));
        assert!(text.contains(r#"broker_relay_requests_total{result="no_match"} 1"#));
        assert!(text.contains("broker_heartbeat_failures_total 1"));
    }

    #[test]
    fn test_latency_percentiles() {
        let mut hist = LatencyHistogram::new(100);
        for v in 1..=100 {
            hist.record(v);
        }
        assert_eq!(hist.percentile(50.0), 51);
        assert_eq!(hist.percentile(99.0), 100);
        assert_eq!(hist.average(), 50);
    }
}
