//! Conversation records: creation, participant key resolution and the head
//! pointer of each conversation's message chain.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use cairn_shared::capability::DirectoryLookup;
use cairn_shared::identity::Identity;
use cairn_shared::locks::KeyedLocks;
use cairn_shared::protocol::MessageType;
use cairn_shared::types::{Cid, ConversationId, MessageId, WalletAddress};
use cairn_store::records::RecordStoreExt;
use cairn_store::RecordStore;

use crate::error::{ConversationError, EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::keystore::KeyStore;

pub const CONVERSATIONS_NAMESPACE: &str = "conversations";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConversationType {
    Direct,
    Group,
    Channel,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionType {
    /// X25519 pairwise key between the two members
    Pairwise,
    /// Random content key wrapped for every member
    GroupWrapped,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    Synced,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub wallet_address: WalletAddress,
    /// Hex X25519 key; empty until the directory resolves the wallet.
    pub public_key: String,
    /// Hex Ed25519 key; empty until resolved.
    pub signing_key: String,
    pub display_name: Option<String>,
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    fn unresolved(wallet: WalletAddress) -> Self {
        Self {
            wallet_address: wallet,
            public_key: String::new(),
            signing_key: String::new(),
            display_name: None,
            joined_at: Utc::now(),
        }
    }

    fn local(identity: &Identity) -> Self {
        Self {
            wallet_address: identity.wallet_address.clone(),
            public_key: identity.public_key.clone(),
            signing_key: identity.signing_key.clone(),
            display_name: identity.display_name.clone(),
            joined_at: Utc::now(),
        }
    }

    pub fn has_keys(&self) -> bool {
        !self.public_key.is_empty() && !self.signing_key.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSettings {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub muted: bool,
    /// Applied to sends that do not set their own expiry.
    pub default_expires_in_secs: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessagePreview {
    pub message_id: MessageId,
    pub sender: WalletAddress,
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(rename = "type")]
    pub conversation_type: ConversationType,
    pub participants: Vec<Participant>,
    pub settings: ConversationSettings,
    pub encryption_type: EncryptionType,
    pub head_cid: Option<Cid>,
    #[serde(default)]
    pub head_depth: u64,
    pub genesis_cid: Option<Cid>,
    #[serde(default)]
    pub message_count: u64,
    pub last_message: Option<MessagePreview>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub sync_state: SyncState,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub archived: bool,
}

impl Conversation {
    pub fn participant(&self, wallet: &WalletAddress) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| &p.wallet_address == wallet)
    }

    pub fn has_participant(&self, wallet: &WalletAddress) -> bool {
        self.participant(wallet).is_some()
    }

    /// Participants other than `local`.
    pub fn others<'a>(&'a self, local: &'a WalletAddress) -> impl Iterator<Item = &'a Participant> {
        self.participants
            .iter()
            .filter(move |p| &p.wallet_address != local)
    }

    pub fn unresolved(&self) -> Vec<WalletAddress> {
        self.participants
            .iter()
            .filter(|p| !p.has_keys())
            .map(|p| p.wallet_address.clone())
            .collect()
    }
}

pub struct ConversationStore {
    keystore: Arc<KeyStore>,
    records: Arc<dyn RecordStore>,
    directory: Arc<dyn DirectoryLookup>,
    events: EventBus,
    timeout: Duration,
    cache: Mutex<HashMap<ConversationId, Conversation>>,
    direct_locks: KeyedLocks<WalletAddress>,
    adopt_locks: KeyedLocks<ConversationId>,
}

impl ConversationStore {
    /// Build the store and load every persisted conversation.
    pub fn new(
        keystore: Arc<KeyStore>,
        records: Arc<dyn RecordStore>,
        directory: Arc<dyn DirectoryLookup>,
        events: EventBus,
        timeout: Duration,
    ) -> Result<Self> {
        let loaded: Vec<Conversation> = records.list_json(CONVERSATIONS_NAMESPACE)?;
        debug!(count = loaded.len(), "conversations loaded");
        let cache = loaded.into_iter().map(|c| (c.id.clone(), c)).collect();

        Ok(Self {
            keystore,
            records,
            directory,
            events,
            timeout,
            cache: Mutex::new(cache),
            direct_locks: KeyedLocks::new(),
            adopt_locks: KeyedLocks::new(),
        })
    }

    /// Create a conversation with `wallets` (the local wallet is added
    /// implicitly). A direct conversation that already exists is returned
    /// as is.
    pub async fn create(
        &self,
        conversation_type: ConversationType,
        wallets: &[WalletAddress],
        settings: Option<ConversationSettings>,
    ) -> Result<Conversation> {
        let identity = self.keystore.identity()?;
        let mut others: Vec<WalletAddress> = wallets
            .iter()
            .filter(|w| **w != identity.wallet_address)
            .cloned()
            .collect();
        others.sort();
        others.dedup();

        match conversation_type {
            ConversationType::Direct => {
                let [other] = others.as_slice() else {
                    return Err(ConversationError::InvalidParticipants(format!(
                        "a direct conversation needs exactly one other wallet, got {}",
                        others.len()
                    ))
                    .into());
                };
                let _guard = self.direct_locks.lock(other).await;
                if let Some(existing) = self.find_direct(other) {
                    return Ok(existing);
                }
                let id = ConversationId::direct(&identity.wallet_address, other);
                self.build(id, conversation_type, &identity, &others, settings)
                    .await
            }
            ConversationType::Group | ConversationType::Channel => {
                if others.is_empty() {
                    return Err(ConversationError::InvalidParticipants(
                        "a group needs at least one other wallet".into(),
                    )
                    .into());
                }
                self.build(
                    ConversationId::random(),
                    conversation_type,
                    &identity,
                    &others,
                    settings,
                )
                .await
            }
        }
    }

    /// The direct conversation with `wallet`, created on first use. Two
    /// concurrent calls for the same wallet yield the same conversation.
    pub async fn get_or_create_direct(&self, wallet: &WalletAddress) -> Result<Conversation> {
        self.create(ConversationType::Direct, std::slice::from_ref(wallet), None)
            .await
    }

    pub async fn create_group(
        &self,
        name: &str,
        wallets: &[WalletAddress],
    ) -> Result<Conversation> {
        let settings = ConversationSettings {
            name: Some(name.to_string()),
            ..Default::default()
        };
        self.create(ConversationType::Group, wallets, Some(settings))
            .await
    }

    /// Make sure a conversation first seen on the wire exists locally.
    pub async fn adopt(
        &self,
        id: &ConversationId,
        conversation_type: ConversationType,
        members: &[WalletAddress],
    ) -> Result<Conversation> {
        if let Some(existing) = self.get(id) {
            return Ok(existing);
        }
        let identity = self.keystore.identity()?;
        if !members.contains(&identity.wallet_address) {
            return Err(ConversationError::InvalidParticipants(format!(
                "{} is not a member of {id}",
                identity.wallet_address.short()
            ))
            .into());
        }

        if conversation_type == ConversationType::Direct {
            let others: Vec<WalletAddress> = members
                .iter()
                .filter(|w| **w != identity.wallet_address)
                .cloned()
                .collect();
            let conversation = self
                .create(ConversationType::Direct, &others, None)
                .await?;
            if &conversation.id != id {
                return Err(ConversationError::InvalidParticipants(format!(
                    "direct conversation id {id} does not match its members"
                ))
                .into());
            }
            return Ok(conversation);
        }

        let _guard = self.adopt_locks.lock(id).await;
        if let Some(existing) = self.get(id) {
            return Ok(existing);
        }
        let mut others: Vec<WalletAddress> = members
            .iter()
            .filter(|w| **w != identity.wallet_address)
            .cloned()
            .collect();
        others.sort();
        others.dedup();
        self.build(id.clone(), conversation_type, &identity, &others, None)
            .await
    }

    pub fn get(&self, id: &ConversationId) -> Option<Conversation> {
        self.cache().get(id).cloned()
    }

    pub fn require(&self, id: &ConversationId) -> Result<Conversation> {
        self.get(id).ok_or_else(|| EngineError::not_found(id))
    }

    /// All conversations, most recently active first.
    pub fn list(&self) -> Vec<Conversation> {
        let mut all: Vec<Conversation> = self.cache().values().cloned().collect();
        all.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        all
    }

    /// Point the conversation at a freshly pinned node. Callers hold the
    /// conversation's head lock and only pass CIDs that pinned.
    pub fn update_head(
        &self,
        id: &ConversationId,
        cid: Cid,
        depth: u64,
        preview: Option<MessagePreview>,
    ) -> Result<Conversation> {
        self.modify(id, |c| {
            if depth == 0 && c.genesis_cid.is_none() {
                c.genesis_cid = Some(cid.clone());
            }
            c.head_cid = Some(cid);
            c.head_depth = depth;
            c.message_count = depth + 1;
            c.last_activity_at = preview
                .as_ref()
                .map(|p| p.timestamp.max(c.last_activity_at))
                .unwrap_or_else(Utc::now);
            if preview.is_some() {
                c.last_message = preview;
            }
        })
    }

    pub fn set_genesis(&self, id: &ConversationId, cid: Cid) -> Result<Conversation> {
        self.modify(id, |c| {
            c.genesis_cid.get_or_insert(cid);
        })
    }

    pub fn record_unread(&self, id: &ConversationId) -> Result<Conversation> {
        self.modify(id, |c| c.unread_count = c.unread_count.saturating_add(1))
    }

    pub fn mark_read(&self, id: &ConversationId) -> Result<Conversation> {
        self.modify(id, |c| c.unread_count = 0)
    }

    pub fn set_sync_state(&self, id: &ConversationId, state: SyncState) -> Result<Conversation> {
        self.modify(id, |c| c.sync_state = state)
    }

    pub fn update_settings(
        &self,
        id: &ConversationId,
        settings: ConversationSettings,
    ) -> Result<Conversation> {
        self.modify(id, |c| c.settings = settings)
    }

    /// Soft archival; conversations are never deleted.
    pub fn archive(&self, id: &ConversationId, archived: bool) -> Result<Conversation> {
        self.modify(id, |c| c.archived = archived)
    }

    /// Retry directory resolution for participants without keys.
    pub async fn refresh_keys(&self, id: &ConversationId) -> Result<Conversation> {
        let conversation = self.require(id)?;
        let missing = conversation.unresolved();
        if missing.is_empty() {
            return Ok(conversation);
        }

        let mut resolved = Vec::new();
        for wallet in missing {
            let participant = self.resolve_participant(wallet).await;
            if participant.has_keys() {
                resolved.push(participant);
            }
        }
        if resolved.is_empty() {
            return Ok(conversation);
        }

        self.modify(id, |c| {
            for fresh in resolved {
                if let Some(p) = c
                    .participants
                    .iter_mut()
                    .find(|p| p.wallet_address == fresh.wallet_address)
                {
                    p.public_key = fresh.public_key;
                    p.signing_key = fresh.signing_key;
                    p.display_name = fresh.display_name;
                }
            }
        })
    }

    fn find_direct(&self, wallet: &WalletAddress) -> Option<Conversation> {
        self.cache()
            .values()
            .find(|c| {
                c.conversation_type == ConversationType::Direct && c.has_participant(wallet)
            })
            .cloned()
    }

    async fn build(
        &self,
        id: ConversationId,
        conversation_type: ConversationType,
        identity: &Identity,
        others: &[WalletAddress],
        settings: Option<ConversationSettings>,
    ) -> Result<Conversation> {
        let mut participants = vec![Participant::local(identity)];
        for wallet in others {
            participants.push(self.resolve_participant(wallet.clone()).await);
        }

        let now = Utc::now();
        let conversation = Conversation {
            id: id.clone(),
            conversation_type,
            participants,
            settings: settings.unwrap_or_default(),
            encryption_type: match conversation_type {
                ConversationType::Direct => EncryptionType::Pairwise,
                _ => EncryptionType::GroupWrapped,
            },
            head_cid: None,
            head_depth: 0,
            genesis_cid: None,
            message_count: 0,
            last_message: None,
            unread_count: 0,
            sync_state: SyncState::Idle,
            last_activity_at: now,
            created_at: now,
            archived: false,
        };

        self.records
            .put_json(CONVERSATIONS_NAMESPACE, &id.0, &conversation)?;
        self.cache().insert(id.clone(), conversation.clone());

        let unresolved = conversation.unresolved().len();
        info!(conversation = %id, kind = ?conversation_type, unresolved, "conversation created");
        self.events
            .publish(EngineEvent::ConversationCreated { conversation_id: id });
        Ok(conversation)
    }

    async fn resolve_participant(&self, wallet: WalletAddress) -> Participant {
        match tokio::time::timeout(self.timeout, self.directory.resolve(&wallet)).await {
            Ok(Ok(Some(record))) if record.wallet == wallet => Participant {
                wallet_address: wallet,
                public_key: record.public_key,
                signing_key: record.signing_key,
                display_name: record.display_name,
                joined_at: Utc::now(),
            },
            Ok(Ok(Some(_))) => {
                warn!(wallet = %wallet.short(), "directory answered with a record for another wallet");
                Participant::unresolved(wallet)
            }
            Ok(Ok(None)) => {
                debug!(wallet = %wallet.short(), "wallet not in directory yet");
                Participant::unresolved(wallet)
            }
            Ok(Err(e)) => {
                warn!(wallet = %wallet.short(), error = %e, "directory lookup failed");
                Participant::unresolved(wallet)
            }
            Err(_) => {
                warn!(wallet = %wallet.short(), "directory lookup timed out");
                Participant::unresolved(wallet)
            }
        }
    }

    fn modify(
        &self,
        id: &ConversationId,
        f: impl FnOnce(&mut Conversation),
    ) -> Result<Conversation> {
        let updated = {
            let mut cache = self.cache();
            let conversation = cache.get_mut(id).ok_or_else(|| EngineError::not_found(id))?;
            let mut next = conversation.clone();
            f(&mut next);
            self.records
                .put_json(CONVERSATIONS_NAMESPACE, &id.0, &next)?;
            *conversation = next.clone();
            next
        };
        self.events.publish(EngineEvent::ConversationUpdated {
            conversation_id: id.clone(),
        });
        Ok(updated)
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<ConversationId, Conversation>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDirectory;
    use cairn_shared::constants::DIR_PEER_PREFIX;
    use cairn_shared::identity::PeerRecord;
    use cairn_store::MemoryRecordStore;

    fn wallet(c: char) -> WalletAddress {
        WalletAddress::parse(&format!("0x{}", c.to_string().repeat(40))).unwrap()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<ConversationStore>,
        directory: Arc<MemoryDirectory>,
        records: Arc<MemoryRecordStore>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let records = Arc::new(MemoryRecordStore::new());
        let keystore = Arc::new(KeyStore::new(records.clone(), dir.path().join("k"), "pw"));
        keystore.generate_identity(wallet('a'), None).unwrap();
        let directory = MemoryDirectory::new();
        let store = ConversationStore::new(
            keystore,
            records.clone(),
            directory.clone(),
            EventBus::new(64),
            Duration::from_secs(1),
        )
        .unwrap();
        Fixture {
            _dir: dir,
            store: Arc::new(store),
            directory,
            records,
        }
    }

    async fn publish_peer(directory: &MemoryDirectory, w: &WalletAddress) {
        let record = PeerRecord {
            wallet: w.clone(),
            public_key: "11".repeat(32),
            signing_key: "22".repeat(32),
            display_name: Some("Bob".into()),
        };
        directory
            .announce(
                &format!("{DIR_PEER_PREFIX}{w}"),
                serde_json::to_vec(&record).unwrap(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_direct_resolves_participant() {
        let f = fixture();
        publish_peer(&f.directory, &wallet('b')).await;

        let conv = f.store.get_or_create_direct(&wallet('b')).await.unwrap();
        assert_eq!(conv.participants.len(), 2);
        assert_eq!(conv.id, ConversationId::direct(&wallet('a'), &wallet('b')));
        assert_eq!(conv.encryption_type, EncryptionType::Pairwise);
        let bob = conv.participant(&wallet('b')).unwrap();
        assert!(bob.has_keys());
        assert_eq!(bob.display_name.as_deref(), Some("Bob"));
    }

    #[tokio::test]
    async fn test_unresolved_participant_then_refresh() {
        let f = fixture();
        let conv = f.store.get_or_create_direct(&wallet('b')).await.unwrap();
        assert_eq!(conv.unresolved(), vec![wallet('b')]);

        publish_peer(&f.directory, &wallet('b')).await;
        let refreshed = f.store.refresh_keys(&conv.id).await.unwrap();
        assert!(refreshed.unresolved().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_direct() {
        let f = fixture();
        f.directory.set_latency(Some(Duration::from_millis(20)));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = f.store.clone();
                tokio::spawn(async move { store.get_or_create_direct(&wallet('b')).await })
            })
            .collect();
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap().unwrap().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(f.store.list().len(), 1);
    }

    #[tokio::test]
    async fn test_direct_rejects_wrong_participant_count() {
        let f = fixture();
        let err = f
            .store
            .create(ConversationType::Direct, &[wallet('b'), wallet('c')], None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Conversation(ConversationError::InvalidParticipants(_))
        ));
        // only the local wallet
        assert!(f
            .store
            .create(ConversationType::Direct, &[wallet('a')], None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_group_and_head_updates_persist() {
        let f = fixture();
        let group = f
            .store
            .create_group("crew", &[wallet('b'), wallet('c'), wallet('b')])
            .await
            .unwrap();
        assert_eq!(group.participants.len(), 3);
        assert_eq!(group.encryption_type, EncryptionType::GroupWrapped);

        let cid = Cid::for_bytes(b"node");
        let updated = f.store.update_head(&group.id, cid.clone(), 0, None).unwrap();
        assert_eq!(updated.head_cid.as_ref(), Some(&cid));
        assert_eq!(updated.genesis_cid.as_ref(), Some(&cid));
        assert_eq!(updated.message_count, 1);

        f.store.record_unread(&group.id).unwrap();
        f.store.record_unread(&group.id).unwrap();
        assert_eq!(f.store.get(&group.id).unwrap().unread_count, 2);
        f.store.mark_read(&group.id).unwrap();

        let stored: Conversation = f
            .records
            .get_json(CONVERSATIONS_NAMESPACE, &group.id.0)
            .unwrap()
            .unwrap();
        assert_eq!(stored.head_cid, Some(cid));
        assert_eq!(stored.unread_count, 0);
    }

    #[tokio::test]
    async fn test_adopt_rejects_outsiders() {
        let f = fixture();
        let id = ConversationId::random();
        let err = f
            .store
            .adopt(&id, ConversationType::Group, &[wallet('b'), wallet('c')])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Conversation(ConversationError::InvalidParticipants(_))
        ));

        let adopted = f
            .store
            .adopt(&id, ConversationType::Group, &[wallet('a'), wallet('b')])
            .await
            .unwrap();
        assert_eq!(adopted.id, id);
        assert_eq!(adopted.participants.len(), 2);
    }

    #[test]
    fn test_unknown_conversation() {
        let f = fixture();
        let err = f.store.mark_read(&ConversationId::random()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Conversation(ConversationError::NotFound(_))
        ));
    }
}
