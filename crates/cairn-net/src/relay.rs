use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use tokio::sync::mpsc;
use tracing::info;

use crate::error::NetError;
use crate::swarm::{extract_peer_id, SwarmCommand};

/// `<relay_addr>/p2p/<relay_peer_id>/p2p-circuit`
pub fn build_circuit_addr(relay_addr: &Multiaddr, relay_peer_id: &PeerId) -> Multiaddr {
    let base = if extract_peer_id(relay_addr).is_some() {
        relay_addr.clone()
    } else {
        relay_addr.clone().with(Protocol::P2p(*relay_peer_id))
    };
    base.with(Protocol::P2pCircuit)
}

/// Dial a relay so the relay client can obtain a reservation on it.
///
/// `relay_addr` must end in `/p2p/<peer id>`.
pub async fn request_relay_reservation(
    cmd_tx: &mpsc::Sender<SwarmCommand>,
    relay_addr: &Multiaddr,
) -> Result<(), NetError> {
    let relay_peer_id = extract_peer_id(relay_addr)
        .ok_or_else(|| NetError::InvalidAddress(format!("{relay_addr} has no /p2p component")))?;
    let circuit_addr = build_circuit_addr(relay_addr, &relay_peer_id);

    info!(relay = %relay_peer_id, addr = %circuit_addr, "Requesting relay reservation");

    cmd_tx
        .send(SwarmCommand::Dial(relay_addr.clone()))
        .await
        .map_err(|_| NetError::ChannelClosed)?;
    cmd_tx
        .send(SwarmCommand::Dial(circuit_addr))
        .await
        .map_err(|_| NetError::ChannelClosed)
}
