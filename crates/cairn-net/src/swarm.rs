//! Main swarm orchestration with tokio mpsc command/notification pattern.
//!
//! The swarm event loop runs in a dedicated tokio task. External code talks
//! to it through [`SwarmCommand`]s; request/response style commands carry a
//! `oneshot` reply channel. Kademlia lookups are tracked by `QueryId` until
//! they yield a record or finish empty.

use std::collections::HashMap;
use std::path::PathBuf;

use futures::StreamExt;
use libp2p::{
    dcutr, gossipsub, identify,
    kad::{self, store::RecordStore as _, QueryId, Quorum, Record, RecordKey},
    multiaddr::Protocol,
    relay,
    swarm::SwarmEvent,
    Multiaddr, PeerId,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use cairn_shared::constants::DEFAULT_QUIC_PORT;

use crate::behaviour::CairnEvent;
use crate::discovery::load_bootstrap_peers;
use crate::peers::{PeerStats, PeerTracker};
use crate::transport::build_swarm;

/// Commands sent *into* the swarm task.
#[derive(Debug)]
pub enum SwarmCommand {
    /// Dial a remote peer at the given multiaddr.
    Dial(Multiaddr),
    /// Publish on a GossipSub topic; the reply carries the gossipsub error text.
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), String>>,
    },
    Subscribe(String),
    Unsubscribe(String),
    /// Store a Kademlia record locally and replicate it.
    PutRecord {
        key: Vec<u8>,
        value: Vec<u8>,
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// Look a Kademlia record up on the network, falling back to the local
    /// store when nobody answers.
    GetRecord {
        key: Vec<u8>,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    /// Request current connection counts.
    GetPeerStats(oneshot::Sender<PeerStats>),
    /// Gracefully shut down the swarm.
    Shutdown,
}

/// Notifications sent *from* the swarm task to the application.
#[derive(Debug, Clone)]
pub enum SwarmNotification {
    PeerConnected {
        peer_id: PeerId,
        address: Multiaddr,
    },
    PeerDisconnected {
        peer_id: PeerId,
    },
    /// A GossipSub message was received.
    MessageReceived {
        source: Option<PeerId>,
        topic: String,
        data: Vec<u8>,
    },
    RelayReservation {
        relay_peer: PeerId,
    },
}

/// Configuration for spawning the swarm.
pub struct SwarmConfig {
    /// Path to the bootstrap peers configuration file.
    pub bootstrap_peers_path: Option<PathBuf>,
    /// Port to listen on (defaults to `DEFAULT_QUIC_PORT`).
    pub listen_port: u16,
    /// Additional multiaddrs to dial on startup.
    pub extra_dials: Vec<Multiaddr>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            bootstrap_peers_path: None,
            listen_port: DEFAULT_QUIC_PORT,
            extra_dials: Vec::new(),
        }
    }
}

/// Spawn the libp2p swarm in a background tokio task.
///
/// Returns `(command_tx, notification_rx, local_peer_id)`.
pub async fn spawn_swarm(
    keypair: libp2p::identity::Keypair,
    config: SwarmConfig,
) -> anyhow::Result<(
    mpsc::Sender<SwarmCommand>,
    mpsc::Receiver<SwarmNotification>,
    PeerId,
)> {
    let mut swarm = build_swarm(keypair)?;
    let local_peer_id = *swarm.local_peer_id();

    let listen_addr_v4: Multiaddr =
        format!("/ip4/0.0.0.0/udp/{}/quic-v1", config.listen_port).parse()?;
    let listen_addr_v6: Multiaddr = format!("/ip6/::/udp/{}/quic-v1", config.listen_port).parse()?;

    swarm.listen_on(listen_addr_v4)?;
    swarm.listen_on(listen_addr_v6)?;

    info!(peer_id = %local_peer_id, port = config.listen_port, "Swarm listening");

    if let Some(ref path) = config.bootstrap_peers_path {
        let bootstrap_addrs = load_bootstrap_peers(path);
        for addr in &bootstrap_addrs {
            if let Some(peer_id) = extract_peer_id(addr) {
                swarm
                    .behaviour_mut()
                    .kademlia
                    .add_address(&peer_id, addr.clone());
            }
            if let Err(e) = swarm.dial(addr.clone()) {
                warn!(addr = %addr, error = %e, "Failed to dial bootstrap peer");
            }
        }

        if !bootstrap_addrs.is_empty() {
            if let Err(e) = swarm.behaviour_mut().kademlia.bootstrap() {
                warn!(error = %e, "Kademlia bootstrap failed to start");
            }
        }
    }

    for addr in &config.extra_dials {
        if let Err(e) = swarm.dial(addr.clone()) {
            warn!(addr = %addr, error = %e, "Failed to dial extra address");
        }
    }

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SwarmCommand>(256);
    let (notif_tx, notif_rx) = mpsc::channel::<SwarmNotification>(256);

    tokio::spawn(async move {
        let mut peer_tracker = PeerTracker::new();
        let mut pending_gets: HashMap<QueryId, (RecordKey, oneshot::Sender<Option<Vec<u8>>>)> =
            HashMap::new();

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SwarmCommand::Dial(addr)) => {
                            if let Err(e) = swarm.dial(addr.clone()) {
                                error!(addr = %addr, error = %e, "Dial failed");
                            }
                        }
                        Some(SwarmCommand::Publish { topic, data, reply }) => {
                            let result = swarm
                                .behaviour_mut()
                                .gossipsub
                                .publish(gossipsub::IdentTopic::new(&topic), data)
                                .map(|_| ())
                                .map_err(|e| e.to_string());
                            if let Err(ref e) = result {
                                debug!(topic = %topic, error = %e, "Publish failed");
                            }
                            let _ = reply.send(result);
                        }
                        Some(SwarmCommand::Subscribe(topic)) => {
                            if let Err(e) = swarm
                                .behaviour_mut()
                                .gossipsub
                                .subscribe(&gossipsub::IdentTopic::new(&topic))
                            {
                                error!(topic = %topic, error = %e, "Subscribe failed");
                            }
                        }
                        Some(SwarmCommand::Unsubscribe(topic)) => {
                            swarm
                                .behaviour_mut()
                                .gossipsub
                                .unsubscribe(&gossipsub::IdentTopic::new(&topic));
                        }
                        Some(SwarmCommand::PutRecord { key, value, reply }) => {
                            let record = Record::new(RecordKey::new(&key), value);
                            let result = swarm
                                .behaviour_mut()
                                .kademlia
                                .put_record(record, Quorum::One)
                                .map(|_| ())
                                .map_err(|e| e.to_string());
                            let _ = reply.send(result);
                        }
                        Some(SwarmCommand::GetRecord { key, reply }) => {
                            let key = RecordKey::new(&key);
                            let query_id = swarm.behaviour_mut().kademlia.get_record(key.clone());
                            pending_gets.insert(query_id, (key, reply));
                        }
                        Some(SwarmCommand::GetPeerStats(reply)) => {
                            let _ = reply.send(peer_tracker.stats());
                        }
                        Some(SwarmCommand::Shutdown) => {
                            info!("Swarm shutdown requested");
                            break;
                        }
                        None => {
                            info!("Command channel closed, shutting down swarm");
                            break;
                        }
                    }
                }

                event = swarm.select_next_some() => {
                    match event {
                        SwarmEvent::Behaviour(CairnEvent::Gossipsub(
                            gossipsub::Event::Message { message, .. },
                        )) => {
                            let topic = message.topic.to_string();
                            debug!(
                                topic = %topic,
                                source = ?message.source,
                                len = message.data.len(),
                                "GossipSub message received"
                            );
                            let _ = notif_tx
                                .send(SwarmNotification::MessageReceived {
                                    source: message.source,
                                    topic,
                                    data: message.data,
                                })
                                .await;
                        }

                        SwarmEvent::Behaviour(CairnEvent::Kademlia(
                            kad::Event::OutboundQueryProgressed { id, result, .. },
                        )) => match result {
                            kad::QueryResult::GetRecord(Ok(kad::GetRecordOk::FoundRecord(
                                kad::PeerRecord { record, .. },
                            ))) => {
                                if let Some((_, reply)) = pending_gets.remove(&id) {
                                    let _ = reply.send(Some(record.value));
                                }
                                if let Some(mut query) = swarm.behaviour_mut().kademlia.query_mut(&id) {
                                    query.finish();
                                }
                            }
                            kad::QueryResult::GetRecord(Ok(_)) => {
                                if let Some((key, reply)) = pending_gets.remove(&id) {
                                    let local = swarm
                                        .behaviour_mut()
                                        .kademlia
                                        .store_mut()
                                        .get(&key)
                                        .map(|r| r.value.clone());
                                    let _ = reply.send(local);
                                }
                            }
                            kad::QueryResult::GetRecord(Err(e)) => {
                                debug!(error = %e, "Kademlia get_record finished without a record");
                                if let Some((key, reply)) = pending_gets.remove(&id) {
                                    let local = swarm
                                        .behaviour_mut()
                                        .kademlia
                                        .store_mut()
                                        .get(&key)
                                        .map(|r| r.value.clone());
                                    let _ = reply.send(local);
                                }
                            }
                            kad::QueryResult::PutRecord(Err(e)) => {
                                debug!(error = %e, "Kademlia record replication incomplete");
                            }
                            other => {
                                debug!(result = ?other, "Kademlia query progressed");
                            }
                        },

                        SwarmEvent::Behaviour(CairnEvent::Identify(
                            identify::Event::Received { peer_id, info, .. },
                        )) => {
                            debug!(
                                peer = %peer_id,
                                protocol = ?info.protocol_version,
                                "Identify: received info from peer"
                            );
                            for addr in &info.listen_addrs {
                                swarm
                                    .behaviour_mut()
                                    .kademlia
                                    .add_address(&peer_id, addr.clone());
                            }
                        }

                        SwarmEvent::Behaviour(CairnEvent::RelayClient(
                            relay::client::Event::ReservationReqAccepted { relay_peer_id, .. },
                        )) => {
                            info!(relay = %relay_peer_id, "Relay reservation accepted");
                            let _ = notif_tx
                                .send(SwarmNotification::RelayReservation {
                                    relay_peer: relay_peer_id,
                                })
                                .await;
                        }

                        SwarmEvent::Behaviour(CairnEvent::Dcutr(dcutr::Event {
                            remote_peer_id,
                            result,
                        })) => match result {
                            Ok(_) => peer_tracker.upgrade_to_direct(&remote_peer_id),
                            Err(e) => debug!(peer = %remote_peer_id, error = %e, "Hole punch failed"),
                        },

                        SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                            let addr = endpoint.get_remote_address().clone();
                            let is_relayed = addr.iter().any(|p| matches!(p, Protocol::P2pCircuit));
                            peer_tracker.on_connected(peer_id, addr.clone(), is_relayed);

                            info!(peer = %peer_id, addr = %addr, relayed = is_relayed, "Peer connected");
                            let _ = notif_tx
                                .send(SwarmNotification::PeerConnected { peer_id, address: addr })
                                .await;
                        }

                        SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                            if num_established == 0 {
                                peer_tracker.on_disconnected(&peer_id);
                                info!(peer = %peer_id, "Peer disconnected");
                                let _ = notif_tx
                                    .send(SwarmNotification::PeerDisconnected { peer_id })
                                    .await;
                            }
                        }

                        SwarmEvent::NewListenAddr { address, .. } => {
                            info!(addr = %address, "Listening on new address");
                        }

                        SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                            warn!(peer = ?peer_id, error = %error, "Outgoing connection error");
                        }

                        SwarmEvent::IncomingConnectionError { error, .. } => {
                            warn!(error = %error, "Incoming connection error");
                        }

                        _ => {}
                    }
                }
            }
        }

        info!("Swarm event loop terminated");
    });

    Ok((cmd_tx, notif_rx, local_peer_id))
}

/// Extract a `PeerId` from a multiaddr, if one is present.
pub(crate) fn extract_peer_id(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_peer_id() {
        let peer = PeerId::random();
        let addr: Multiaddr = format!("/ip4/10.0.0.1/udp/4001/quic-v1/p2p/{peer}")
            .parse()
            .unwrap();
        assert_eq!(extract_peer_id(&addr), Some(peer));

        let bare: Multiaddr = "/ip4/10.0.0.1/udp/4001/quic-v1".parse().unwrap();
        assert_eq!(extract_peer_id(&bare), None);
    }
}
