//! Capability adapters over the libp2p swarm.
//!
//! All three talk to the swarm task through its command channel:
//! gossipsub for pub/sub, Kademlia records for the directory, and Kademlia
//! records plus the local block table for content.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cairn_net::{SwarmCommand, SwarmNotification};
use cairn_shared::capability::{ContentStore, DirectoryLookup, InboundMessage, PubSubTransport};
use cairn_shared::constants::DIR_PEER_PREFIX;
use cairn_shared::error::{ContentError, DirectoryError, TransportError};
use cairn_shared::identity::PeerRecord;
use cairn_shared::types::{canonical_json_bytes, canonicalize, Cid, WalletAddress};
use cairn_store::Database;

#[derive(Clone)]
pub struct GossipTransport {
    cmd_tx: mpsc::Sender<SwarmCommand>,
}

impl GossipTransport {
    pub fn new(cmd_tx: mpsc::Sender<SwarmCommand>) -> Self {
        Self { cmd_tx }
    }
}

#[async_trait]
impl PubSubTransport for GossipTransport {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        cairn_net::subscribe_topic(&self.cmd_tx, topic)
            .await
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        cairn_net::unsubscribe_topic(&self.cmd_tx, topic)
            .await
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError> {
        cairn_net::publish(&self.cmd_tx, topic, data)
            .await
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Forward swarm notifications to the engine. Gossip payloads become
/// [`InboundMessage`]s; connection changes are only logged.
pub fn spawn_notification_bridge(
    mut notifications: mpsc::Receiver<SwarmNotification>,
    inbound: mpsc::Sender<InboundMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("swarm notification bridge started");
        while let Some(notification) = notifications.recv().await {
            match notification {
                SwarmNotification::MessageReceived { source, topic, data } => {
                    let message = InboundMessage {
                        topic,
                        source: source.map(|p| p.to_string()),
                        data,
                    };
                    if inbound.send(message).await.is_err() {
                        debug!("engine inbox closed, stopping bridge");
                        break;
                    }
                }
                SwarmNotification::PeerConnected { peer_id, address } => {
                    info!(peer = %peer_id, addr = %address, "peer connected");
                }
                SwarmNotification::PeerDisconnected { peer_id } => {
                    info!(peer = %peer_id, "peer disconnected");
                }
                SwarmNotification::RelayReservation { relay_peer } => {
                    info!(relay = %relay_peer, "relay reservation accepted");
                }
            }
        }
        info!("swarm notification bridge stopped");
    })
}

#[derive(Clone)]
pub struct KadDirectory {
    cmd_tx: mpsc::Sender<SwarmCommand>,
}

impl KadDirectory {
    pub fn new(cmd_tx: mpsc::Sender<SwarmCommand>) -> Self {
        Self { cmd_tx }
    }
}

#[async_trait]
impl DirectoryLookup for KadDirectory {
    async fn resolve(&self, wallet: &WalletAddress) -> Result<Option<PeerRecord>, DirectoryError> {
        let key = format!("{DIR_PEER_PREFIX}{wallet}");
        let Some(raw) = self.lookup(&key).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| DirectoryError::Malformed {
                key,
                reason: e.to_string(),
            })
    }

    async fn announce(&self, key: &str, value: Vec<u8>) -> Result<(), DirectoryError> {
        cairn_net::put_record(&self.cmd_tx, key.as_bytes(), value)
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))
    }

    async fn lookup(&self, key: &str) -> Result<Option<Vec<u8>>, DirectoryError> {
        cairn_net::get_record(&self.cmd_tx, key.as_bytes())
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))
    }
}

/// Blocks live in the local SQLite table and are replicated as Kademlia
/// records keyed by CID. Fetched blocks are checked against their CID
/// before they are cached.
pub struct KadContentStore {
    db: Arc<Database>,
    cmd_tx: mpsc::Sender<SwarmCommand>,
}

impl KadContentStore {
    pub fn new(db: Arc<Database>, cmd_tx: mpsc::Sender<SwarmCommand>) -> Self {
        Self { db, cmd_tx }
    }
}

#[async_trait]
impl ContentStore for KadContentStore {
    async fn put(&self, value: &Value) -> Result<Cid, ContentError> {
        let canonical = canonicalize(value);
        let cid = Cid::for_json(&canonical);
        self.db
            .put_block(cid.as_str(), &canonical)
            .map_err(|e| ContentError::Backend(e.to_string()))?;

        // the local copy is authoritative; replication catches up on republish
        if let Err(e) = cairn_net::put_record(
            &self.cmd_tx,
            cid.as_str().as_bytes(),
            canonical_json_bytes(&canonical),
        )
        .await
        {
            warn!(cid = %cid, error = %e, "block replication failed");
        }
        Ok(cid)
    }

    async fn get(&self, cid: &Cid) -> Result<Value, ContentError> {
        if let Some(value) = self
            .db
            .get_block(cid.as_str())
            .map_err(|e| ContentError::Backend(e.to_string()))?
        {
            return Ok(value);
        }

        let raw = cairn_net::get_record(&self.cmd_tx, cid.as_str().as_bytes())
            .await
            .map_err(|e| ContentError::Backend(e.to_string()))?
            .ok_or_else(|| ContentError::NotFound(cid.to_string()))?;
        let value: Value =
            serde_json::from_slice(&raw).map_err(|_| ContentError::Mismatch(cid.to_string()))?;
        if !cid.matches(&value) {
            return Err(ContentError::Mismatch(cid.to_string()));
        }

        self.db
            .put_block(cid.as_str(), &value)
            .map_err(|e| ContentError::Backend(e.to_string()))?;
        debug!(cid = %cid, "block fetched from network");
        Ok(value)
    }

    async fn has(&self, cid: &Cid) -> bool {
        self.db.has_block(cid.as_str()).unwrap_or(false)
    }
}
