use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("Swarm command channel closed")]
    ChannelClosed,

    #[error("Swarm dropped the reply")]
    NoReply,

    #[error("Gossipsub error on {topic}: {reason}")]
    Gossipsub { topic: String, reason: String },

    #[error("Kademlia error: {0}")]
    Kademlia(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid keypair: {0}")]
    Keypair(String),
}
