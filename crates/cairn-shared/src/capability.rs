//! Capabilities the messaging engine needs from the outside world.
//!
//! Each trait has a libp2p-backed implementation and an in-memory one; the
//! engine only ever sees `Arc<dyn Trait>`.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ContentError, DirectoryError, TransportError};
use crate::identity::PeerRecord;
use crate::types::{Cid, WalletAddress};

/// Content-addressed storage of immutable JSON values.
///
/// `put` is idempotent: the same value always yields the same CID.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn put(&self, value: &Value) -> Result<Cid, ContentError>;

    async fn get(&self, cid: &Cid) -> Result<Value, ContentError>;

    async fn has(&self, cid: &Cid) -> bool;
}

/// A payload received on a subscribed topic.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    /// Transport-level origin, if known (libp2p peer id or hub handle name)
    pub source: Option<String>,
    pub data: Vec<u8>,
}

/// Best-effort, at-most-once topic messaging.
///
/// Inbound messages are delivered on the `mpsc::Sender<InboundMessage>` the
/// implementation was constructed with.
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError>;
}

/// Wallet resolution plus a small key/value announce space.
#[async_trait]
pub trait DirectoryLookup: Send + Sync {
    async fn resolve(&self, wallet: &WalletAddress) -> Result<Option<PeerRecord>, DirectoryError>;

    async fn announce(&self, key: &str, value: Vec<u8>) -> Result<(), DirectoryError>;

    async fn lookup(&self, key: &str) -> Result<Option<Vec<u8>>, DirectoryError>;
}
