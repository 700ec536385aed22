//! Heartbeat supervisor.
//!
//! Periodic HTTP GET probes through the tunnel. Sustained failure can
//! force-terminate the process; that is the liveness escape hatch when the
//! tunnel is wedged but the process looks healthy from the outside.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::{Host, Url};

use broker_shared::config::HeartbeatConfig;
use broker_shared::{Error, Result};

use crate::metrics::Metrics;
use crate::netstack::VirtualNet;

/// Running supervisor. Stopping waits for the periodic task to exit.
pub struct Heartbeat {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Heartbeat {
    pub async fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.task.await;
    }
}

/// Issue the first probe (optionally gating startup on it), then start the
/// periodic task.
pub async fn start(
    config: &HeartbeatConfig,
    net: VirtualNet,
    user_agent: String,
    metrics: Metrics,
) -> Result<Heartbeat> {
    config.validate()?;

    let probe = Probe::new(config, net, user_agent)?;
    let mut counter = FailureCounter::new(config.panic_after_failure_count);

    let first = probe.execute().await;
    if config.first_heartbeat_must_succeed {
        if let Err(e) = &first {
            return Err(Error::Heartbeat(format!("first heartbeat failed: {e}")));
        }
    }
    apply_observation(counter.observe(first.is_ok()), &first, &metrics);

    let interval = Duration::from_secs(config.interval_seconds);
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = ticker.tick() => {
                    let result = probe.execute().await;
                    apply_observation(counter.observe(result.is_ok()), &result, &metrics);
                }
            }
        }
    });

    Ok(Heartbeat {
        stop: stop_tx,
        task,
    })
}

fn apply_observation(observation: Observation, result: &Result<()>, metrics: &Metrics) {
    match observation {
        Observation::Ok => debug!("heartbeat.ok"),
        Observation::Connected => info!("heartbeat.connected"),
        Observation::Failure(failures) => {
            metrics.record_heartbeat_failure();
            match result {
                Err(e) => warn!(failures, error = %e, "heartbeat.failure"),
                Ok(()) => warn!(failures, "heartbeat.failure"),
            }
        }
        Observation::Terminate(failures) => {
            metrics.record_heartbeat_failure();
            error!(failures, "heartbeat.terminating");
            std::process::exit(2);
        }
    }
}

/// Consecutive-failure accounting, confined to the supervisor task.
struct FailureCounter {
    failures: u32,
    panic_after: u32,
    ever_succeeded: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Observation {
    /// Probe succeeded, nothing notable.
    Ok,
    /// Probe succeeded after downtime (or for the first time).
    Connected,
    /// Probe failed; carries the consecutive failure count.
    Failure(u32),
    /// Failure limit reached.
    Terminate(u32),
}

impl FailureCounter {
    fn new(panic_after: u32) -> Self {
        Self {
            failures: 0,
            panic_after,
            ever_succeeded: false,
        }
    }

    fn observe(&mut self, success: bool) -> Observation {
        if success {
            let had_failures = self.failures > 0;
            self.failures = 0;
            if had_failures || !self.ever_succeeded {
                self.ever_succeeded = true;
                return Observation::Connected;
            }
            return Observation::Ok;
        }

        self.failures += 1;
        if self.panic_after > 0 && self.failures >= self.panic_after {
            Observation::Terminate(self.failures)
        } else {
            Observation::Failure(self.failures)
        }
    }
}

/// A single probe target, pre-resolved from the heartbeat URL.
struct Probe {
    net: VirtualNet,
    addr: SocketAddr,
    target: String,
    host_header: String,
    user_agent: String,
    timeout: Duration,
}

impl Probe {
    fn new(config: &HeartbeatConfig, net: VirtualNet, user_agent: String) -> Result<Self> {
        let url = Url::parse(&config.url)?;
        if url.scheme() != "http" {
            return Err(Error::Heartbeat(
                "heartbeat url must be http; the tunnel provides confidentiality".into(),
            ));
        }

        let ip = match url.host() {
            Some(Host::Ipv4(a)) => IpAddr::V4(a),
            Some(Host::Ipv6(a)) => IpAddr::V6(a),
            Some(Host::Domain(domain)) => {
                return Err(Error::Heartbeat(format!(
                    "heartbeat host '{domain}' must be an IP address inside the tunnel"
                )))
            }
            None => return Err(Error::Heartbeat("heartbeat url has no host".into())),
        };
        let port = url.port_or_known_default().unwrap_or(80);

        let mut target = url.path().to_string();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }

        let host = url.host_str().unwrap_or("").to_string();
        let host_header = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host,
        };

        Ok(Self {
            net,
            addr: SocketAddr::new(ip, port),
            target,
            host_header,
            user_agent,
            timeout: Duration::from_secs(config.timeout_seconds),
        })
    }

    /// One GET through the tunnel; 2xx counts as alive.
    async fn execute(&self) -> Result<()> {
        let attempt = async {
            let mut stream = self.net.dial(self.addr).await?;

            let mut request = format!(
                "GET {} HTTP/1.1\r\nHost: {}\r\n",
                self.target, self.host_header
            );
            if !self.user_agent.is_empty() {
                request.push_str(&format!("User-Agent: {}\r\n", self.user_agent));
            }
            request.push_str("Connection: close\r\n\r\n");
            stream.write_all(request.as_bytes()).await?;

            let mut response = Vec::new();
            let mut chunk = [0u8; 2048];
            loop {
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                response.extend_from_slice(&chunk[..n]);
                if response.windows(2).any(|w| w == b"\r\n") || response.len() > 8192 {
                    break;
                }
            }

            let status = parse_status_code(&response)
                .ok_or_else(|| Error::Heartbeat("malformed heartbeat response".into()))?;
            if (200..300).contains(&status) {
                Ok(())
            } else {
                Err(Error::Heartbeat(format!("HTTP {status}")))
            }
        };

        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }
}

fn parse_status_code(response: &[u8]) -> Option<u16> {
    let line_end = response.windows(2).position(|w| w == b"\r\n")?;
    let line = std::str::from_utf8(&response[..line_end]).ok()?;
    line.split_whitespace().nth(1)?.parse().ok()
}
