//! Composed libp2p `NetworkBehaviour` for Cairn nodes.

use libp2p::{
    dcutr, gossipsub, identify,
    kad::{self, store::MemoryStore},
    relay,
    swarm::NetworkBehaviour,
};

/// All sub-behaviours are driven by the single swarm event loop in
/// [`crate::swarm`]. Construction lives in [`crate::transport::build_swarm`].
///
/// The derive generates [`CairnEvent`] with one variant per field.
#[derive(NetworkBehaviour)]
pub struct CairnBehaviour {
    /// Conversation, inbox, presence and signaling topics
    pub gossipsub: gossipsub::Behaviour,
    /// Peer routing plus directory / block records
    pub kademlia: kad::Behaviour<MemoryStore>,
    pub identify: identify::Behaviour,
    /// Circuit relay v2 client for NAT traversal
    pub relay_client: relay::client::Behaviour,
    pub dcutr: dcutr::Behaviour,
}

pub use self::CairnBehaviourEvent as CairnEvent;
