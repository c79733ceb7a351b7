// P2P networking layer built on libp2p with QUIC transport.
//
// Gossipsub carries conversation, inbox, presence and signaling topics;
// Kademlia records back the wallet directory and the replicated block store.

pub mod behaviour;
pub mod discovery;
pub mod error;
pub mod messages;
pub mod peers;
pub mod relay;
pub mod swarm;
pub mod transport;

pub use behaviour::{CairnBehaviour, CairnEvent};
pub use discovery::{load_bootstrap_peers, parse_multiaddrs};
pub use error::NetError;
pub use messages::{
    get_record, peer_stats, publish, put_record, subscribe_topic, unsubscribe_topic,
};
pub use peers::{ConnectionInfo, ConnectionMode, PeerStats, PeerTracker};
pub use relay::request_relay_reservation;
pub use swarm::{spawn_swarm, SwarmCommand, SwarmConfig, SwarmNotification};
pub use transport::{build_swarm, derive_keypair};
