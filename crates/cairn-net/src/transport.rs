use std::time::Duration;

use libp2p::gossipsub::{self, MessageAuthenticity, MessageId, ValidationMode};
use libp2p::identity::Keypair;
use libp2p::kad::{self, store::MemoryStore, store::MemoryStoreConfig};
use libp2p::{dcutr, identify, noise, StreamProtocol, SwarmBuilder};
use tracing::info;

use cairn_shared::constants::{
    GOSSIPSUB_HEARTBEAT_SECS, KDF_CONTEXT_LIBP2P_KEY, MAX_MESSAGE_SIZE, OFFLINE_TTL_SECS,
    PROTOCOL_VERSION,
};

use crate::behaviour::CairnBehaviour;
use crate::error::NetError;

const KAD_PROTOCOL: StreamProtocol = StreamProtocol::new("/cairn/kad/1.0.0");

/// Deterministic libp2p identity derived from the node's Ed25519 signing
/// secret, so a restart keeps the same `PeerId`.
pub fn derive_keypair(secret: &[u8; 32]) -> Result<Keypair, NetError> {
    let seed = blake3::derive_key(KDF_CONTEXT_LIBP2P_KEY, secret);
    Keypair::ed25519_from_bytes(seed).map_err(|e| NetError::Keypair(e.to_string()))
}

pub fn build_swarm(keypair: Keypair) -> anyhow::Result<libp2p::Swarm<CairnBehaviour>> {
    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_quic()
        .with_relay_client(noise::Config::new, libp2p::yamux::Config::default)?
        .with_behaviour(|key, relay_client| -> std::result::Result<CairnBehaviour, Box<dyn std::error::Error + Send + Sync>> {
            let local_peer_id = key.public().to_peer_id();

            // Content-derived ids so a republished notice is deduplicated.
            let message_id_fn = |message: &gossipsub::Message| {
                let mut hasher = blake3::Hasher::new();
                hasher.update(message.topic.as_str().as_bytes());
                hasher.update(&message.data);
                MessageId::from(hasher.finalize().to_hex().to_string())
            };

            let gossipsub_config = gossipsub::ConfigBuilder::default()
                .heartbeat_interval(Duration::from_secs(GOSSIPSUB_HEARTBEAT_SECS))
                .validation_mode(ValidationMode::Strict)
                .max_transmit_size(MAX_MESSAGE_SIZE)
                .message_id_fn(message_id_fn)
                .build()
                .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> {
                    format!("GossipSub config: {e}").into()
                })?;

            let gossipsub = gossipsub::Behaviour::new(
                MessageAuthenticity::Signed(key.clone()),
                gossipsub_config,
            )
            .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> {
                format!("GossipSub init: {e}").into()
            })?;

            // Offline queues must outlive their longest entry.
            let record_ttl = Duration::from_secs(OFFLINE_TTL_SECS as u64);
            let mut kad_config = kad::Config::new(KAD_PROTOCOL);
            kad_config
                .set_record_ttl(Some(record_ttl))
                .set_query_timeout(Duration::from_secs(30));

            let store = MemoryStore::with_config(
                local_peer_id,
                MemoryStoreConfig {
                    max_value_bytes: MAX_MESSAGE_SIZE,
                    max_records: 16 * 1024,
                    ..Default::default()
                },
            );
            let mut kademlia = kad::Behaviour::with_config(local_peer_id, store, kad_config);
            kademlia.set_mode(Some(kad::Mode::Server));

            let identify_config =
                identify::Config::new(PROTOCOL_VERSION.to_string(), key.public())
                    .with_push_listen_addr_updates(true)
                    .with_interval(Duration::from_secs(60));
            let identify = identify::Behaviour::new(identify_config);

            let dcutr = dcutr::Behaviour::new(local_peer_id);

            Ok(CairnBehaviour {
                gossipsub,
                kademlia,
                identify,
                relay_client,
                dcutr,
            })
        })?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    info!(
        peer_id = %swarm.local_peer_id(),
        "Built Cairn swarm with QUIC + Relay transport"
    );

    Ok(swarm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_is_deterministic() {
        let a = derive_keypair(&[7u8; 32]).unwrap();
        let b = derive_keypair(&[7u8; 32]).unwrap();
        let c = derive_keypair(&[8u8; 32]).unwrap();
        assert_eq!(a.public().to_peer_id(), b.public().to_peer_id());
        assert_ne!(a.public().to_peer_id(), c.public().to_peer_id());
    }
}
