//! In-process capabilities for tests and single-process setups.
//!
//! A [`MemoryHub`] plays the gossip network: every [`MemoryPubSub`]
//! connected to it receives what the others publish on topics it subscribed
//! to. [`MemoryContentStore`] and [`MemoryDirectory`] are meant to be shared
//! between all peers of a test, like the DHT they stand in for.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use cairn_shared::capability::{ContentStore, DirectoryLookup, InboundMessage, PubSubTransport};
use cairn_shared::constants::DIR_PEER_PREFIX;
use cairn_shared::error::{ContentError, DirectoryError, TransportError};
use cairn_shared::identity::PeerRecord;
use cairn_shared::types::{canonicalize, Cid, WalletAddress};

const INBOUND_CAPACITY: usize = 1024;

struct Subscriber {
    node: u64,
    tx: mpsc::Sender<InboundMessage>,
    online: Arc<AtomicBool>,
}

#[derive(Default)]
pub struct MemoryHub {
    next_node: AtomicU64,
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a new peer. The receiver yields what other peers publish on
    /// the topics this one subscribes to.
    pub fn connect(
        self: &Arc<Self>,
        name: &str,
    ) -> (Arc<MemoryPubSub>, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let pubsub = Arc::new(MemoryPubSub {
            hub: self.clone(),
            node: self.next_node.fetch_add(1, Ordering::SeqCst),
            name: name.to_string(),
            tx,
            online: Arc::new(AtomicBool::new(true)),
            stalled: AtomicBool::new(false),
            topics: Mutex::new(HashSet::new()),
        });
        (pubsub, rx)
    }

    fn deliver(&self, from: u64, source: &str, topic: &str, data: &[u8]) -> usize {
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        let Some(subscribers) = topics.get(topic) else {
            return 0;
        };
        let mut delivered = 0;
        for sub in subscribers {
            if sub.node == from || !sub.online.load(Ordering::SeqCst) {
                continue;
            }
            let msg = InboundMessage {
                topic: topic.to_string(),
                source: Some(source.to_string()),
                data: data.to_vec(),
            };
            // at-most-once: a full inbox drops the message
            if sub.tx.try_send(msg).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

pub struct MemoryPubSub {
    hub: Arc<MemoryHub>,
    node: u64,
    name: String,
    tx: mpsc::Sender<InboundMessage>,
    online: Arc<AtomicBool>,
    stalled: AtomicBool,
    topics: Mutex<HashSet<String>>,
}

impl MemoryPubSub {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// While offline this peer neither publishes nor receives.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Make `subscribe` and `publish` hang without ever answering, like a
    /// swarm task that stopped replying.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    async fn stall(&self) {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }

    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .topics
            .lock()
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }
}

#[async_trait]
impl PubSubTransport for MemoryPubSub {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.stall().await;
        let fresh = self
            .topics
            .lock()
            .map(|mut t| t.insert(topic.to_string()))
            .unwrap_or(false);
        if fresh {
            let mut topics = self.hub.topics.lock().unwrap_or_else(|e| e.into_inner());
            topics.entry(topic.to_string()).or_default().push(Subscriber {
                node: self.node,
                tx: self.tx.clone(),
                online: self.online.clone(),
            });
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        if let Ok(mut t) = self.topics.lock() {
            t.remove(topic);
        }
        let mut topics = self.hub.topics.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|s| s.node != self.node);
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError> {
        self.stall().await;
        if !self.is_online() {
            return Err(TransportError::Unavailable(format!("{} is offline", self.name)));
        }
        let delivered = self.hub.deliver(self.node, &self.name, topic, &data);
        debug!(topic, delivered, "memory publish");
        Ok(())
    }
}

/// Shared content-addressed block map.
#[derive(Default)]
pub struct MemoryContentStore {
    blocks: RwLock<HashMap<Cid, Value>>,
    failing: AtomicBool,
}

impl MemoryContentStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every `put` and `get` fail, as if the network were down.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.blocks.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), ContentError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ContentError::Backend("content network unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(&self, value: &Value) -> Result<Cid, ContentError> {
        self.check()?;
        let canonical = canonicalize(value);
        let cid = Cid::for_json(&canonical);
        self.blocks
            .write()
            .map_err(|_| ContentError::Backend("lock poisoned".into()))?
            .entry(cid.clone())
            .or_insert(canonical);
        Ok(cid)
    }

    async fn get(&self, cid: &Cid) -> Result<Value, ContentError> {
        self.check()?;
        self.blocks
            .read()
            .map_err(|_| ContentError::Backend("lock poisoned".into()))?
            .get(cid)
            .cloned()
            .ok_or_else(|| ContentError::NotFound(cid.to_string()))
    }

    async fn has(&self, cid: &Cid) -> bool {
        self.blocks
            .read()
            .map(|b| b.contains_key(cid))
            .unwrap_or(false)
    }
}

/// Shared key/value directory.
#[derive(Default)]
pub struct MemoryDirectory {
    records: RwLock<HashMap<String, Vec<u8>>>,
    latency: Mutex<Option<Duration>>,
}

impl MemoryDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Delay every operation, to keep work in flight during a test.
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut l) = self.latency.lock() {
            *l = latency;
        }
    }

    /// Forget a record, as if it had expired from the DHT.
    pub fn remove(&self, key: &str) -> bool {
        self.records
            .write()
            .map(|mut r| r.remove(key).is_some())
            .unwrap_or(false)
    }

    async fn wait(&self) {
        let latency = self.latency.lock().ok().and_then(|l| *l);
        if let Some(d) = latency {
            tokio::time::sleep(d).await;
        }
    }
}

#[async_trait]
impl DirectoryLookup for MemoryDirectory {
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
        self.wait().await;
        self.records
            .write()
            .map_err(|_| DirectoryError::Unavailable("lock poisoned".into()))?
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn lookup(&self, key: &str) -> Result<Option<Vec<u8>>, DirectoryError> {
        self.wait().await;
        Ok(self
            .records
            .read()
            .map_err(|_| DirectoryError::Unavailable("lock poisoned".into()))?
            .get(key)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_hub_fanout_skips_sender() {
        let hub = MemoryHub::new();
        let (a, mut a_rx) = hub.connect("a");
        let (b, mut b_rx) = hub.connect("b");
        a.subscribe("t").await.unwrap();
        b.subscribe("t").await.unwrap();

        a.publish("t", b"hi".to_vec()).await.unwrap();

        let got = b_rx.recv().await.unwrap();
        assert_eq!(got.data, b"hi");
        assert_eq!(got.source.as_deref(), Some("a"));
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offline_peer_misses_messages() {
        let hub = MemoryHub::new();
        let (a, _a_rx) = hub.connect("a");
        let (b, mut b_rx) = hub.connect("b");
        b.subscribe("t").await.unwrap();
        b.set_online(false);

        a.publish("t", b"lost".to_vec()).await.unwrap();
        assert!(b_rx.try_recv().is_err());
        assert!(b.publish("t", vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_content_store_is_idempotent() {
        let store = MemoryContentStore::new();
        let a = store.put(&json!({"b": 1, "a": 2})).await.unwrap();
        let b = store.put(&json!({"a": 2, "b": 1})).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        assert!(a.matches(&store.get(&a).await.unwrap()));

        store.set_failing(true);
        assert!(store.put(&json!({"c": 3})).await.is_err());
    }

    #[tokio::test]
    async fn test_directory_resolve() {
        let dir = MemoryDirectory::new();
        let wallet = WalletAddress::parse("0x1111111111111111111111111111111111111111").unwrap();
        assert!(dir.resolve(&wallet).await.unwrap().is_none());

        let record = PeerRecord {
            wallet: wallet.clone(),
            public_key: "aa".into(),
            signing_key: "bb".into(),
            display_name: None,
        };
        dir.announce(
            &format!("{DIR_PEER_PREFIX}{wallet}"),
            serde_json::to_vec(&record).unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(dir.resolve(&wallet).await.unwrap(), Some(record));
    }
}
