//! WireGuard tunnel bring-up.
//!
//! Turns the validated config into boringtun sessions: selects the replica's
//! private key, resolves DNS peer endpoints, and spawns the netstack
//! dataplane. Also holds the key generation helpers for the CLI.

use std::net::SocketAddr;

use boringtun::noise::Tunn;
use boringtun::x25519::{PublicKey, StaticSecret};
use rand::seq::SliceRandom;

use broker_shared::config::{WireguardBase, WIREGUARD_KEY_LEN};
use broker_shared::{Error, Result};

use crate::netstack::{self, NetstackConfig, NetstackHandle, PeerConfig, VirtualNet};

/// Validate the config, resolve peer endpoints, and bring the tunnel up.
/// Any failure surfaces before the dataplane task exists, so there is no
/// partial state to unwind.
pub async fn start(
    config: &WireguardBase,
    replica_index: usize,
) -> Result<(VirtualNet, NetstackHandle)> {
    config.validate(replica_index)?;

    let local_addr = config.replica_local_address(replica_index)?;
    let private_key = StaticSecret::from(config.replica_key(replica_index)?);

    let mut peers = Vec::with_capacity(config.peers.len());
    for (i, peer) in config.peers.iter().enumerate() {
        let endpoint = match peer.endpoint.as_deref() {
            Some(endpoint) => Some(resolve_endpoint(endpoint).await?),
            None => None,
        };

        let mut public_key = [0u8; WIREGUARD_KEY_LEN];
        public_key.copy_from_slice(peer.public_key.as_slice());

        let tunn = Tunn::new(
            private_key.clone(),
            PublicKey::from(public_key),
            None,
            peer.keepalive(),
            i as u32,
            None,
        )
        .map_err(|e| Error::Tunnel(e.to_string()))?;

        peers.push(PeerConfig {
            tunn,
            endpoint,
            allowed_ips: peer.allowed_network()?,
        });
    }

    netstack::spawn(NetstackConfig {
        local_addr,
        mtu: config.mtu,
        listen_port: config.listen_port,
        peers,
    })
    .await
}

/// Resolve a `host:port` endpoint. IP literals pass through; DNS names get
/// one address chosen at random from the answer.
async fn resolve_endpoint(endpoint: &str) -> Result<SocketAddr> {
    if let Ok(addr) = endpoint.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(endpoint)
        .await
        .map_err(|e| Error::Tunnel(format!("lookup failed for '{endpoint}': {e}")))?
        .collect();

    addrs
        .choose(&mut rand::thread_rng())
        .copied()
        .ok_or_else(|| Error::Tunnel(format!("no addresses for '{endpoint}'")))
}

/// Generate `count` private keys, concatenated.
pub fn generate_private_keys(count: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(count * WIREGUARD_KEY_LEN);
    for _ in 0..count {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        out.extend_from_slice(secret.as_bytes());
    }
    out
}

/// Derive the public key for each concatenated private key.
pub fn derive_public_keys(private_keys: &[u8]) -> Result<Vec<u8>> {
    if private_keys.is_empty() || private_keys.len() % WIREGUARD_KEY_LEN != 0 {
        return Err(Error::Config(format!(
            "private key material must be a multiple of {WIREGUARD_KEY_LEN} bytes"
        )));
    }

    let mut out = Vec::with_capacity(private_keys.len());
    for chunk in private_keys.chunks_exact(WIREGUARD_KEY_LEN) {
        let mut key = [0u8; WIREGUARD_KEY_LEN];
        key.copy_from_slice(chunk);
        let secret = StaticSecret::from(key);
        out.extend_from_slice(PublicKey::from(&secret).as_bytes());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_derive_key_counts() {
        let keys = generate_private_keys(3);
        assert_eq!(keys.len(), 3 * WIREGUARD_KEY_LEN);

        let publics = derive_public_keys(&keys).unwrap();
        assert_eq!(publics.len(), 3 * WIREGUARD_KEY_LEN);

        // Same private key always derives the same public key.
        let again = derive_public_keys(&keys).unwrap();
        assert_eq!(publics, again);
    }

    #[test]
    fn test_derive_rejects_truncated_input() {
        assert!(derive_public_keys(&[]).is_err());
        assert!(derive_public_keys(&[0u8; 31]).is_err());
        assert!(derive_public_keys(&[0u8; 33]).is_err());
    }

    #[tokio::test]
    async fn test_resolve_endpoint_ip_literal() {
        assert_eq!(
            resolve_endpoint("127.0.0.1:51820").await.unwrap(),
            "127.0.0.1:51820".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            resolve_endpoint("[::1]:51820").await.unwrap(),
            "[::1]:51820".parse::<SocketAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn test_resolve_endpoint_hostname() {
        let addr = resolve_endpoint("localhost:51820").await.unwrap();
        assert_eq!(addr.port(), 51820);
        assert!(addr.ip().is_loopback());
    }
}
