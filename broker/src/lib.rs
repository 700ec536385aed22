//! Semgrep network broker.
//!
//! Grants the Semgrep backend controlled, bidirectional access to services
//! inside a customer network: an allowlisting reverse proxy served inside a
//! WireGuard tunnel, a predicate-filtered webhook relay, and a heartbeat
//! that gates startup and guards liveness.

pub mod headers;
pub mod heartbeat;
pub mod http_client;
pub mod inbound;
pub mod logging;
pub mod metrics;
pub mod netstack;
pub mod orchestrator;
pub mod relay_server;
pub mod server;
pub mod wireguard;
