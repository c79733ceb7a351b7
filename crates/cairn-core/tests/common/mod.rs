#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use cairn_core::memory::{MemoryContentStore, MemoryDirectory, MemoryHub, MemoryPubSub};
use cairn_core::{Capabilities, EngineConfig, KeyStore, Messenger};
use cairn_media::scripted::ScriptedBackend;
use cairn_shared::types::WalletAddress;
use cairn_store::{MemoryRecordStore, RecordStore};

/// One shared network: gossip hub, content blocks and directory.
pub struct Net {
    pub hub: Arc<MemoryHub>,
    pub content: Arc<MemoryContentStore>,
    pub directory: Arc<MemoryDirectory>,
}

pub struct Peer {
    pub messenger: Arc<Messenger>,
    pub pubsub: Arc<MemoryPubSub>,
    pub backend: Arc<ScriptedBackend>,
    /// The peer's local durable store
    pub records: Arc<dyn RecordStore>,
    _dir: TempDir,
}

impl Peer {
    pub fn wallet(&self) -> &WalletAddress {
        self.messenger.wallet()
    }
}

pub fn wallet(c: char) -> WalletAddress {
    WalletAddress::parse(&format!("0x{}", c.to_string().repeat(40))).unwrap()
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        network_timeout: Duration::from_secs(2),
        pin_retry_limit: 2,
        pin_backoff: vec![Duration::ZERO],
        ..EngineConfig::default()
    }
}

impl Net {
    pub fn new() -> Self {
        Self {
            hub: MemoryHub::new(),
            content: MemoryContentStore::new(),
            directory: MemoryDirectory::new(),
        }
    }

    pub async fn peer(&self, c: char, name: &str) -> Peer {
        self.peer_with(c, name, test_config()).await
    }

    /// A started messenger whose peer record is already published.
    pub async fn peer_with(&self, c: char, name: &str, config: EngineConfig) -> Peer {
        let dir = tempfile::tempdir().unwrap();
        let records: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let keystore = Arc::new(KeyStore::new(
            records.clone(),
            dir.path().join("identity.key"),
            "test passphrase",
        ));
        keystore
            .generate_identity(wallet(c), Some(name.to_string()))
            .unwrap();

        let (pubsub, inbound) = self.hub.connect(name);
        let caps = Capabilities {
            records: records.clone(),
            content: self.content.clone(),
            pubsub: pubsub.clone(),
            directory: self.directory.clone(),
        };
        let backend = Arc::new(ScriptedBackend::auto_connecting());
        let messenger = Messenger::new(keystore, caps, backend.clone(), config).unwrap();
        messenger.start(inbound).await.unwrap();
        messenger.publish_peer_record().await.unwrap();

        Peer {
            messenger,
            pubsub,
            backend,
            records,
            _dir: dir,
        }
    }
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
