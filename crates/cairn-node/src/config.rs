//! Node configuration loaded from environment variables.
//!
//! All settings have defaults so a node can start with zero configuration,
//! as long as an identity already exists in the data directory.

use std::path::PathBuf;
use std::time::Duration;

use cairn_core::EngineConfig;
use cairn_shared::constants::DEFAULT_QUIC_PORT;
use cairn_shared::types::WalletAddress;

#[derive(Clone)]
pub struct NodeConfig {
    /// QUIC port for the swarm.
    /// Env: `CAIRN_LISTEN_PORT`
    /// Default: `4001`
    pub listen_port: u16,

    /// File with one bootstrap multiaddr per line.
    /// Env: `CAIRN_BOOTSTRAP_PEERS`
    pub bootstrap_peers_path: Option<PathBuf>,

    /// Relays to request a reservation on (comma-separated multiaddrs, each
    /// ending in `/p2p/<peer id>`).
    /// Env: `CAIRN_RELAYS`
    pub relay_addrs: Vec<String>,

    /// Wallet to create an identity for when none exists.
    /// Env: `CAIRN_WALLET`
    pub wallet: Option<WalletAddress>,

    /// Env: `CAIRN_DISPLAY_NAME`
    pub display_name: Option<String>,

    /// Presence heartbeat and resend period.
    /// Env: `CAIRN_HEARTBEAT_SECS`
    /// Default: 30 seconds
    pub heartbeat_interval: Duration,

    pub engine: EngineConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_QUIC_PORT,
            bootstrap_peers_path: None,
            relay_addrs: Vec::new(),
            wallet: None,
            display_name: None,
            heartbeat_interval: Duration::from_secs(30),
            engine: EngineConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn from_env() -> Self {
        let mut config = Self {
            engine: EngineConfig::from_env(),
            ..Self::default()
        };

        if let Ok(port) = std::env::var("CAIRN_LISTEN_PORT") {
            match port.trim().parse::<u16>() {
                Ok(p) => config.listen_port = p,
                Err(_) => tracing::warn!(value = %port, "Invalid CAIRN_LISTEN_PORT, using default"),
            }
        }

        if let Ok(path) = std::env::var("CAIRN_BOOTSTRAP_PEERS") {
            config.bootstrap_peers_path = Some(PathBuf::from(path));
        }

        if let Ok(raw) = std::env::var("CAIRN_RELAYS") {
            config.relay_addrs = split_list(&raw);
        }

        if let Ok(raw) = std::env::var("CAIRN_WALLET") {
            match WalletAddress::parse(raw.trim()) {
                Ok(wallet) => config.wallet = Some(wallet),
                Err(e) => tracing::warn!(value = %raw, error = %e, "Invalid CAIRN_WALLET, ignoring"),
            }
        }

        if let Ok(name) = std::env::var("CAIRN_DISPLAY_NAME") {
            if !name.trim().is_empty() {
                config.display_name = Some(name.trim().to_string());
            }
        }

        if let Ok(raw) = std::env::var("CAIRN_HEARTBEAT_SECS") {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => config.heartbeat_interval = Duration::from_secs(secs),
                _ => tracing::warn!(value = %raw, "Invalid CAIRN_HEARTBEAT_SECS, using default"),
            }
        }

        config
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.listen_port, 4001);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert!(config.wallet.is_none());
        assert!(config.relay_addrs.is_empty());
    }

    #[test]
    fn test_split_list() {
        assert_eq!(
            split_list(" /ip4/1.2.3.4/udp/4001/quic-v1 ,, /dns4/relay.example/udp/4001/quic-v1"),
            vec![
                "/ip4/1.2.3.4/udp/4001/quic-v1".to_string(),
                "/dns4/relay.example/udp/4001/quic-v1".to_string(),
            ]
        );
        assert!(split_list("").is_empty());
    }
}
