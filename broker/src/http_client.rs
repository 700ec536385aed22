//! Outbound HTTP client construction.
//!
//! Shared transport for the proxy legs, with optional additional CA trust.

use std::time::Duration;

use broker_shared::config::HttpClientConfig;
use broker_shared::{Error, Result};

/// Build the outbound client. Adding CA certs forces a TLS 1.3 floor.
/// Environment proxy variables are honored by default.
pub fn build_client(config: &HttpClientConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(30))
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(90))
        .use_rustls_tls();

    if !config.additional_ca_certs.is_empty() {
        for path in &config.additional_ca_certs {
            let pem = std::fs::read(path)
                .map_err(|e| Error::Config(format!("failed to read CA cert '{path}': {e}")))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| Error::Config(format!("failed to parse CA cert '{path}': {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        builder = builder.min_tls_version(reqwest::tls::Version::TLS_1_3);
    }

    builder
        .build()
        .map_err(|e| Error::Config(format!("failed to build http client: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_default_client() {
        build_client(&HttpClientConfig::default()).unwrap();
    }

    #[test]
    fn test_missing_ca_cert_is_an_error() {
        let config = HttpClientConfig {
            additional_ca_certs: vec!["/does/not/exist.pem".to_string()],
        };
        assert!(build_client(&config).is_err());
    }
}
