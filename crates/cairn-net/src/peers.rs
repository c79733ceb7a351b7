//! Connected-peer bookkeeping for the swarm task.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use libp2p::{Multiaddr, PeerId};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    Direct,
    Relayed,
}

/// Connection counts reported by the swarm task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub connected: usize,
    /// Connections still going through a circuit relay
    pub relayed: usize,
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub peer_id: PeerId,
    pub address: Multiaddr,
    pub mode: ConnectionMode,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct PeerTracker {
    peers: HashMap<PeerId, ConnectionInfo>,
}

impl PeerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connected(&mut self, peer_id: PeerId, address: Multiaddr, is_relayed: bool) {
        let mode = if is_relayed {
            ConnectionMode::Relayed
        } else {
            ConnectionMode::Direct
        };

        debug!(peer = %peer_id, addr = %address, mode = ?mode, "Tracking peer connection");

        // A second connection to a known peer keeps the better (direct) mode.
        self.peers
            .entry(peer_id)
            .and_modify(|info| {
                if mode == ConnectionMode::Direct {
                    info.mode = mode;
                    info.address = address.clone();
                }
            })
            .or_insert(ConnectionInfo {
                peer_id,
                address,
                mode,
                connected_at: Utc::now(),
            });
    }

    pub fn on_disconnected(&mut self, peer_id: &PeerId) {
        if self.peers.remove(peer_id).is_some() {
            debug!(peer = %peer_id, "Removed peer from tracker");
        }
    }

    /// DCUtR succeeded; the relayed connection now has a direct sibling.
    pub fn upgrade_to_direct(&mut self, peer_id: &PeerId) {
        if let Some(info) = self.peers.get_mut(peer_id) {
            info.mode = ConnectionMode::Direct;
            debug!(peer = %peer_id, "Upgraded peer connection to direct");
        }
    }

    pub fn stats(&self) -> PeerStats {
        PeerStats {
            connected: self.peers.len(),
            relayed: self
                .peers
                .values()
                .filter(|info| info.mode == ConnectionMode::Relayed)
                .count(),
        }
    }

    #[cfg(test)]
    fn mode_of(&self, peer_id: &PeerId) -> Option<ConnectionMode> {
        self.peers.get(peer_id).map(|info| info.mode)
    }
}
