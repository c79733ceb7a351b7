//! Bootstrap peer loading.
//!
//! The bootstrap file holds one multiaddr per line; blank lines and `#`
//! comments are ignored.
//!
//! ```text
//! # Cairn bootstrap nodes
//! /ip4/198.51.100.10/udp/4001/quic-v1/p2p/12D3KooW...
//! ```

use std::fs;
use std::path::Path;

use libp2p::Multiaddr;
use tracing::{info, warn};

/// Malformed lines are logged and skipped; an unreadable file yields an
/// empty list.
pub fn load_bootstrap_peers(path: &Path) -> Vec<Multiaddr> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read bootstrap peers file");
            return Vec::new();
        }
    };

    let lines: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect();
    let addrs = parse_multiaddrs(&lines);

    info!(count = addrs.len(), path = %path.display(), "Loaded bootstrap peers");
    addrs
}

/// Parse configured multiaddr strings (bootstrap file lines, relay lists).
pub fn parse_multiaddrs(raw: &[String]) -> Vec<Multiaddr> {
    raw.iter()
        .filter_map(|s| match s.trim().parse::<Multiaddr>() {
            Ok(addr) => Some(addr),
            Err(e) => {
                warn!(addr = %s, error = %e, "Skipping invalid multiaddr");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_from_nonexistent_file() {
        assert!(load_bootstrap_peers(Path::new("/nonexistent/bootstrap.txt")).is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.txt");
        fs::write(
            &path,
            "# bootstrap nodes\n/ip4/127.0.0.1/udp/4001/quic-v1\n\ninvalid-addr\n/ip4/127.0.0.2/udp/4001/quic-v1\n",
        )
        .unwrap();

        assert_eq!(load_bootstrap_peers(&path).len(), 2);
    }

    #[test]
    fn test_parse_multiaddrs() {
        let raw = vec![
            "/ip4/127.0.0.1/udp/4001/quic-v1".to_string(),
            "not-a-multiaddr".to_string(),
        ];
        assert_eq!(parse_multiaddrs(&raw).len(), 1);
    }
}
