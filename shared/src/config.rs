//! Typed broker configuration.
//!
//! Supports deep-merged YAML/JSON config files with base64-decoded key
//! material, redacted secrets, and provider allowlist presets.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ipnet::IpNet;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::allowlist::{Allowlist, AllowlistItem};
use crate::relay::FilteredRelayConfig;
use crate::{Error, Result};

/// Length of a WireGuard (x25519) key in bytes.
pub const WIREGUARD_KEY_LEN: usize = 32;

pub const REDACTED: &str = "REDACTED";

/// Byte field that round-trips through base64 strings in config files.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Base64Bytes(pub Vec<u8>);

impl Base64Bytes {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Base64Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", BASE64.encode(&self.0))
    }
}

impl Serialize for Base64Bytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Base64Bytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map(Base64Bytes)
            .map_err(serde::de::Error::custom)
    }
}

/// Byte field holding key material. Decodes like [`Base64Bytes`] but never
/// serializes or debug-prints its contents.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretBase64Bytes(pub Vec<u8>);

impl SecretBase64Bytes {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretBase64Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl fmt::Display for SecretBase64Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl Serialize for SecretBase64Bytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

impl<'de> Deserialize<'de> for SecretBase64Bytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map(SecretBase64Bytes)
            .map_err(serde::de::Error::custom)
    }
}

/// HTTP methods the allowlist can gate on. `Unknown` is the parse fallback
/// and never matches anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Unknown,
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Connect,
    Options,
    Trace,
}

const METHOD_NAMES: [(HttpMethod, &str); 9] = [
    (HttpMethod::Get, "GET"),
    (HttpMethod::Head, "HEAD"),
    (HttpMethod::Post, "POST"),
    (HttpMethod::Put, "PUT"),
    (HttpMethod::Patch, "PATCH"),
    (HttpMethod::Delete, "DELETE"),
    (HttpMethod::Connect, "CONNECT"),
    (HttpMethod::Options, "OPTIONS"),
    (HttpMethod::Trace, "TRACE"),
];

impl HttpMethod {
    pub fn parse(name: &str) -> Self {
        let upper = name.to_ascii_uppercase();
        METHOD_NAMES
            .iter()
            .find(|(_, n)| *n == upper)
            .map(|(m, _)| *m)
            .unwrap_or(HttpMethod::Unknown)
    }

    fn bit(self) -> u16 {
        match self {
            HttpMethod::Unknown => 0,
            HttpMethod::Get => 1 << 1,
            HttpMethod::Head => 1 << 2,
            HttpMethod::Post => 1 << 3,
            HttpMethod::Put => 1 << 4,
            HttpMethod::Patch => 1 << 5,
            HttpMethod::Delete => 1 << 6,
            HttpMethod::Connect => 1 << 7,
            HttpMethod::Options => 1 << 8,
            HttpMethod::Trace => 1 << 9,
        }
    }
}

/// Compact method set, stored as a bitset over [`HttpMethod`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HttpMethods(u16);

impl HttpMethods {
    /// Parse a list of method names. Unknown names are ignored rather than
    /// mapped to a matchable bit.
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Self {
        let mut methods = HttpMethods::default();
        for name in names {
            methods.insert(HttpMethod::parse(name.as_ref()));
        }
        methods
    }

    pub fn insert(&mut self, method: HttpMethod) {
        self.0 |= method.bit();
    }

    pub fn contains(self, method: HttpMethod) -> bool {
        method != HttpMethod::Unknown && self.0 & method.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn names(self) -> Vec<&'static str> {
        METHOD_NAMES
            .iter()
            .filter(|(m, _)| self.contains(*m))
            .map(|(_, n)| *n)
            .collect()
    }
}

impl Serialize for HttpMethods {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.names().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for HttpMethods {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        Ok(HttpMethods::parse(&names))
    }
}

/// One WireGuard peer of the tunnel interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireguardPeer {
    pub public_key: Base64Bytes,
    /// `host:port`; a DNS hostname is resolved once at startup.
    #[serde(default)]
    pub endpoint: Option<String>,
    pub allowed_ips: String,
    #[serde(default = "default_keepalive_interval")]
    pub persistent_keepalive_interval: u16,
    #[serde(default)]
    pub disable_persistent_keepalive: bool,
}

impl WireguardPeer {
    pub fn validate(&self) -> Result<()> {
        if self.public_key.0.len() != WIREGUARD_KEY_LEN {
            return Err(Error::Config(format!(
                "peer public key must be {WIREGUARD_KEY_LEN} bytes, got {}",
                self.public_key.0.len()
            )));
        }
        self.allowed_network()?;
        if let Some(endpoint) = self.endpoint.as_deref() {
            let (host, port) = endpoint
                .rsplit_once(':')
                .ok_or_else(|| Error::Config(format!("peer endpoint '{endpoint}' is not host:port")))?;
            if host.is_empty() {
                return Err(Error::Config(format!("peer endpoint '{endpoint}' has an empty host")));
            }
            port.parse::<u16>()
                .map_err(|_| Error::Config(format!("peer endpoint '{endpoint}' has an invalid port")))?;
        }
        Ok(())
    }

    pub fn allowed_network(&self) -> Result<IpNet> {
        self.allowed_ips
            .parse::<IpNet>()
            .map_err(|e| Error::Config(format!("peer allowedIps '{}': {e}", self.allowed_ips)))
    }

    /// Keepalive interval to program into the tunnel, if any.
    pub fn keepalive(&self) -> Option<u16> {
        if self.disable_persistent_keepalive {
            None
        } else {
            Some(self.persistent_keepalive_interval)
        }
    }
}

/// The tunnel interface itself: local identity plus its peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireguardBase {
    pub local_address: String,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    /// One or more concatenated 32-byte private keys; the replica index
    /// selects which one this process uses.
    pub private_key: SecretBase64Bytes,
    #[serde(default)]
    pub listen_port: u16,
    pub peers: Vec<WireguardPeer>,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub broker_index: usize,
    #[serde(default)]
    pub broker_index_hostname_regex: Option<String>,
}

impl WireguardBase {
    pub fn key_count(&self) -> usize {
        self.private_key.0.len() / WIREGUARD_KEY_LEN
    }

    pub fn validate(&self, replica_index: usize) -> Result<()> {
        self.local_address
            .parse::<IpAddr>()
            .map_err(|e| Error::Config(format!("localAddress '{}': {e}", self.local_address)))?;
        for dns in &self.dns {
            dns.parse::<IpAddr>()
                .map_err(|e| Error::Config(format!("dns address '{dns}': {e}")))?;
        }
        if self.mtu == 0 {
            return Err(Error::Config("mtu must be greater than zero".into()));
        }
        if self.private_key.is_empty() || self.private_key.0.len() % WIREGUARD_KEY_LEN != 0 {
            return Err(Error::Config(format!(
                "privateKey must be a multiple of {WIREGUARD_KEY_LEN} bytes"
            )));
        }
        if replica_index >= self.key_count() {
            return Err(Error::Config(format!(
                "broker index {replica_index} beyond private key count {}",
                self.key_count()
            )));
        }
        if self.peers.is_empty() {
            return Err(Error::Config("at least one peer is required".into()));
        }
        for peer in &self.peers {
            peer.validate()?;
        }
        Ok(())
    }

    /// Pick the replica index: CLI override, then a hostname regex capture,
    /// then the config value.
    pub fn resolve_replica_index(&self, cli_override: Option<usize>) -> Result<usize> {
        if let Some(index) = cli_override {
            debug!(source = "override", value = index, "broker_index.resolved");
            return Ok(index);
        }

        if let Some(pattern) = self.broker_index_hostname_regex.as_deref() {
            let re = Regex::new(pattern)
                .map_err(|e| Error::Config(format!("invalid brokerIndexHostnameRegex: {e}")))?;
            let hostname = hostname::get()?.to_string_lossy().into_owned();
            if let Some(caps) = re.captures(&hostname) {
                let group = caps.get(1).ok_or_else(|| {
                    Error::Config(format!(
                        "brokerIndexHostnameRegex must have a capture group: {pattern}"
                    ))
                })?;
                let index = group.as_str().parse::<usize>().map_err(|e| {
                    Error::Config(format!(
                        "hostname capture group '{}' is not an index: {e}",
                        group.as_str()
                    ))
                })?;
                debug!(source = "hostname", value = index, "broker_index.resolved");
                return Ok(index);
            }
        }

        debug!(source = "config", value = self.broker_index, "broker_index.resolved");
        Ok(self.broker_index)
    }

    /// Private key for the given replica.
    pub fn replica_key(&self, replica_index: usize) -> Result<[u8; WIREGUARD_KEY_LEN]> {
        let start = replica_index * WIREGUARD_KEY_LEN;
        let end = start + WIREGUARD_KEY_LEN;
        let slice = self
            .private_key
            .0
            .get(start..end)
            .ok_or_else(|| Error::Config(format!("no private key for replica {replica_index}")))?;
        let mut key = [0u8; WIREGUARD_KEY_LEN];
        key.copy_from_slice(slice);
        Ok(key)
    }

    /// Tunnel-local address for the given replica: the base address advanced
    /// once per replica so that replicas sharing a config get distinct IPs.
    pub fn replica_local_address(&self, replica_index: usize) -> Result<IpAddr> {
        let base = self
            .local_address
            .parse::<IpAddr>()
            .map_err(|e| Error::Config(format!("localAddress '{}': {e}", self.local_address)))?;
        Ok(advance_ip(base, replica_index))
    }
}

fn advance_ip(addr: IpAddr, n: usize) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4).wrapping_add(n as u32))),
        IpAddr::V6(v6) => IpAddr::V6(Ipv6Addr::from(u128::from(v6).wrapping_add(n as u128))),
    }
}

/// HTTP request/response logging toggles, per server and per rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default)]
    pub skip_paths: Vec<String>,
    #[serde(default)]
    pub log_request_body: bool,
    #[serde(default)]
    pub log_request_headers: bool,
    #[serde(default)]
    pub log_response_body: bool,
    #[serde(default)]
    pub log_response_headers: bool,
}

/// Periodic in-tunnel liveness probe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatConfig {
    pub url: String,
    #[serde(default = "default_heartbeat_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_seconds: u64,
    /// Consecutive failures before the process is terminated; 0 disables.
    #[serde(default)]
    pub panic_after_failure_count: u32,
    #[serde(default)]
    pub first_heartbeat_must_succeed: bool,
}

impl HeartbeatConfig {
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(Error::Config("heartbeat url is required".into()));
        }
        if self.interval_seconds < 30 {
            return Err(Error::Config(format!(
                "heartbeat intervalSeconds must be at least 30, got {}",
                self.interval_seconds
            )));
        }
        if self.timeout_seconds == 0 {
            return Err(Error::Config("heartbeat timeoutSeconds must be greater than zero".into()));
        }
        Ok(())
    }
}

/// Outbound HTTP transport options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpClientConfig {
    /// Extra PEM CA files to trust in addition to the system roots.
    #[serde(default)]
    pub additional_ca_certs: Vec<String>,
}

/// Code-hosting provider shortcut: expands into allowlist entries for the
/// provider's API with an auth header baked in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub base_url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub allow_code_access: bool,
}

/// Everything needed to serve the tunnel-side reverse proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundProxyConfig {
    pub wireguard: WireguardBase,
    #[serde(default)]
    pub allowlist: Allowlist,
    #[serde(default = "default_proxy_listen_port")]
    pub proxy_listen_port: u16,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub github: Option<ProviderConfig>,
    #[serde(default)]
    pub gitlab: Option<ProviderConfig>,
    #[serde(default)]
    pub bitbucket: Option<ProviderConfig>,
    #[serde(default)]
    pub http_client: HttpClientConfig,
    #[serde(default = "default_graceful_shutdown")]
    pub graceful_shutdown_seconds: u64,
}

impl InboundProxyConfig {
    pub fn validate(&self, replica_index: usize) -> Result<()> {
        self.wireguard.validate(replica_index)?;
        self.heartbeat.validate()?;
        for item in self.allowlist.iter() {
            item.validate()?;
        }
        Ok(())
    }

    /// Expand the configured provider blocks into allowlist entries.
    pub fn apply_provider_presets(&mut self) {
        if let Some(github) = self.github.clone() {
            let headers = bearer_headers(&github.token);
            for &(path, methods) in GITHUB_PRESETS {
                self.allowlist
                    .push(preset_item(&github.base_url, path, methods, &headers));
            }
            if github.allow_code_access {
                for &(path, methods) in GITHUB_CODE_PRESETS {
                    self.allowlist
                        .push(preset_item(&github.base_url, path, methods, &headers));
                }
            }
        }

        if let Some(gitlab) = self.gitlab.clone() {
            let mut headers = BTreeMap::new();
            if !gitlab.token.is_empty() {
                headers.insert("PRIVATE-TOKEN".to_string(), gitlab.token.clone());
            }
            for &(path, methods) in GITLAB_PRESETS {
                self.allowlist
                    .push(preset_item(&gitlab.base_url, path, methods, &headers));
            }
            if gitlab.allow_code_access {
                for &(path, methods) in GITLAB_CODE_PRESETS {
                    self.allowlist
                        .push(preset_item(&gitlab.base_url, path, methods, &headers));
                }
            }
        }

        if let Some(bitbucket) = self.bitbucket.clone() {
            let headers = bearer_headers(&bitbucket.token);
            for &(path, methods) in BITBUCKET_PRESETS {
                self.allowlist
                    .push(preset_item(&bitbucket.base_url, path, methods, &headers));
            }
        }
    }
}

fn bearer_headers(token: &str) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    if !token.is_empty() {
        headers.insert("Authorization".to_string(), format!("Bearer {token}"));
    }
    headers
}

fn preset_item(
    base_url: &str,
    path: &str,
    methods: &[&str],
    headers: &BTreeMap<String, String>,
) -> AllowlistItem {
    AllowlistItem {
        url: format!("{}{}", base_url.trim_end_matches('/'), path),
        methods: HttpMethods::parse(methods),
        set_request_headers: headers.clone(),
        ..Default::default()
    }
}

const GITHUB_PRESETS: &[(&str, &[&str])] = &[
    ("/repos/:owner/:repo", &["GET"]),
    ("/repos/:owner/:repo/pulls", &["GET"]),
    ("/repos/:owner/:repo/pulls/:number/comments", &["POST"]),
    ("/repos/:owner/:repo/issues/:number/comments", &["POST"]),
    ("/orgs/:org/installation", &["GET"]),
    ("/orgs/:org/installation/repositories", &["GET"]),
    ("/users/:user/installation", &["GET"]),
    ("/users/:user/installation/repositories", &["GET"]),
    ("/app-manifests/:code/conversions", &["POST"]),
    ("/app", &["GET"]),
];

const GITHUB_CODE_PRESETS: &[(&str, &[&str])] = &[
    ("/repos/:repo/contents/:filepath", &["GET"]),
    ("/repos/:repo/commits", &["GET"]),
];

const GITLAB_PRESETS: &[(&str, &[&str])] = &[
    ("/namespaces/:namespace", &["GET"]),
    ("/projects/:project", &["GET"]),
    ("/projects/:project/merge_requests", &["GET"]),
    ("/projects/:project/merge_requests/:number/versions", &["GET"]),
    ("/:entity_type/:namespace/projects", &["GET"]),
    ("/projects/:project/repository/branches", &["GET"]),
    ("/projects/:project/merge_requests/:number/discussions", &["GET", "POST"]),
    ("/projects/:project/merge_requests/:number/discussions/:discussion/notes", &["POST"]),
    ("/projects/:project/merge_requests/:number/discussions/:discussion/notes/:note", &["PUT"]),
    ("/projects/:project/merge_requests/:number/discussions/:discussion", &["PUT"]),
];

const GITLAB_CODE_PRESETS: &[(&str, &[&str])] = &[
    ("/projects/:project/repository/files/:filepath", &["GET"]),
    ("/projects/:project/repository/commits", &["GET"]),
];

const BITBUCKET_PRESETS: &[(&str, &[&str])] = &[
    ("/projects/:project", &["GET"]),
    ("/projects/:project/repos", &["GET"]),
    ("/projects/:project/repos/:repo", &["GET"]),
    ("/projects/:project/repos/:repo/default-branch", &["GET"]),
    ("/projects/:project/repos/:repo/pull-requests", &["GET"]),
    ("/projects/:project/repos/:repo/pull-requests/:number/comments", &["POST"]),
];

/// Everything needed to serve the webhook relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundProxyConfig {
    #[serde(default)]
    pub relay: BTreeMap<String, FilteredRelayConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_relay_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_graceful_shutdown")]
    pub graceful_shutdown_seconds: u64,
}

impl OutboundProxyConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, relay) in &self.relay {
            relay
                .validate()
                .map_err(|e| Error::Config(format!("relay '{name}': {e}")))?;
        }
        Ok(())
    }
}

/// Root configuration. At least one of `inbound`/`outbound` must be present
/// to run the broker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub inbound: Option<InboundProxyConfig>,
    #[serde(default)]
    pub outbound: Option<OutboundProxyConfig>,
}

/// Deep-merge `overlay` into `base`: mappings merge recursively, everything
/// else (scalars, sequences) is replaced.
pub fn merge_values(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    if overlay.is_null() {
        return;
    }
    match overlay {
        serde_yaml::Value::Mapping(overlay_map) => {
            if let serde_yaml::Value::Mapping(base_map) = base {
                for (key, value) in overlay_map {
                    match base_map.entry(key) {
                        serde_yaml::mapping::Entry::Occupied(mut slot) => {
                            merge_values(slot.get_mut(), value);
                        }
                        serde_yaml::mapping::Entry::Vacant(slot) => {
                            slot.insert(value);
                        }
                    }
                }
            } else {
                *base = serde_yaml::Value::Mapping(overlay_map);
            }
        }
        other => *base = other,
    }
}

/// Parse labeled config sources (YAML or JSON), merging them in order, then
/// expand provider presets.
pub fn parse_config_sources(sources: &[(String, String)]) -> Result<Config> {
    let mut merged = serde_yaml::Value::Null;
    for (label, content) in sources {
        let value: serde_yaml::Value = serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse config '{label}': {e}")))?;
        merge_values(&mut merged, value);
    }

    let mut config = if merged.is_null() {
        Config::default()
    } else {
        serde_yaml::from_value(merged)
            .map_err(|e| Error::Config(format!("failed to decode config: {e}")))?
    };

    if let Some(inbound) = config.inbound.as_mut() {
        inbound.apply_provider_presets();
    }

    Ok(config)
}

fn default_keepalive_interval() -> u16 {
    20
}

fn default_mtu() -> usize {
    1420
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_heartbeat_timeout() -> u64 {
    5
}

fn default_proxy_listen_port() -> u16 {
    80
}

fn default_relay_listen_port() -> u16 {
    8080
}

fn default_graceful_shutdown() -> u64 {
    10
}
