//! Per-recipient queue of messages a peer has not seen yet.
//!
//! The sender keeps its own copy under the `queues` namespace and merges the
//! entry into the directory record `offline:<recipient>` so the recipient
//! can discover it when it comes back. Entries only carry the CID; the
//! message itself is pulled from the content store.
//!
//! Directory merges are read-modify-write. Two senders racing on the same
//! recipient may lose one entry; that message is still reachable through the
//! conversation manifest on the next sync.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use cairn_shared::capability::DirectoryLookup;
use cairn_shared::constants::DIR_OFFLINE_PREFIX;
use cairn_shared::error::DirectoryError;
use cairn_shared::locks::KeyedLocks;
use cairn_shared::types::{Cid, ConversationId, MessageId, WalletAddress};
use cairn_store::records::RecordStoreExt;
use cairn_store::RecordStore;

use crate::error::Result;
use crate::keystore::KeyStore;

pub const QUEUES_NAMESPACE: &str = "queues";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub id: String,
    pub message_id: MessageId,
    pub message_cid: Cid,
    pub conversation_id: ConversationId,
    pub sender: WalletAddress,
    pub recipient: WalletAddress,
    /// Higher is pulled first.
    #[serde(default)]
    pub priority: u8,
    pub queued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

impl QueuedMessage {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Body of both the local queue record and the directory record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OfflineQueueRecord {
    pub recipient: WalletAddress,
    pub messages: Vec<QueuedMessage>,
    pub updated_at: DateTime<Utc>,
}

impl OfflineQueueRecord {
    fn empty(recipient: WalletAddress) -> Self {
        Self {
            recipient,
            messages: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Add `entry` unless its message is already queued. Drops expired
    /// entries on the way.
    fn merge(&mut self, entry: &QueuedMessage, now: DateTime<Utc>) -> bool {
        self.messages.retain(|m| !m.is_expired_at(now));
        if self.messages.iter().any(|m| m.message_id == entry.message_id) {
            return false;
        }
        self.messages.push(entry.clone());
        self.updated_at = now;
        true
    }
}

pub struct OfflineMessageQueue {
    keystore: Arc<KeyStore>,
    records: Arc<dyn RecordStore>,
    directory: Arc<dyn DirectoryLookup>,
    ttl: chrono::Duration,
    timeout: Duration,
    locks: KeyedLocks<WalletAddress>,
}

impl OfflineMessageQueue {
    pub fn new(
        keystore: Arc<KeyStore>,
        records: Arc<dyn RecordStore>,
        directory: Arc<dyn DirectoryLookup>,
        ttl: chrono::Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            keystore,
            records,
            directory,
            ttl,
            timeout,
            locks: KeyedLocks::new(),
        }
    }

    /// Queue `cid` for `recipient` and announce the updated queue. A failed
    /// announce is logged; the local entry is kept either way.
    pub async fn enqueue(
        &self,
        recipient: &WalletAddress,
        message_id: MessageId,
        cid: &Cid,
        conversation_id: &ConversationId,
    ) -> Result<QueuedMessage> {
        let sender = self.keystore.wallet()?;
        let now = Utc::now();
        let entry = QueuedMessage {
            id: Uuid::new_v4().simple().to_string(),
            message_id,
            message_cid: cid.clone(),
            conversation_id: conversation_id.clone(),
            sender,
            recipient: recipient.clone(),
            priority: 0,
            queued_at: now,
            expires_at: now + self.ttl,
            retry_count: 0,
        };

        let _guard = self.locks.lock(recipient).await;

        let mut local = self.local_record(recipient)?;
        local.merge(&entry, now);
        self.records
            .put_json(QUEUES_NAMESPACE, recipient.as_str(), &local)?;

        let key = Self::directory_key(recipient);
        let mut remote = match self.read_remote(&key, recipient).await {
            Ok(record) => record,
            Err(e) => {
                warn!(recipient = %recipient.short(), error = %e, "offline queue lookup failed");
                return Ok(entry);
            }
        };
        if remote.merge(&entry, now) {
            if let Err(e) = self.write_remote(&key, &remote).await {
                warn!(recipient = %recipient.short(), error = %e, "offline queue announce failed");
            }
        }

        info!(recipient = %recipient.short(), cid = %cid, "message queued for offline peer");
        Ok(entry)
    }

    /// Our local copy of what `recipient` has not acknowledged.
    pub fn pending_for(&self, recipient: &WalletAddress) -> Result<Vec<QueuedMessage>> {
        let now = Utc::now();
        let mut pending = self.local_record(recipient)?.messages;
        pending.retain(|m| !m.is_expired_at(now));
        Ok(pending)
    }

    /// Forget entries `recipient` confirmed. Returns how many were dropped.
    pub async fn acknowledge(&self, recipient: &WalletAddress, message_ids: &[MessageId]) -> Result<usize> {
        let _guard = self.locks.lock(recipient).await;
        let mut local = self.local_record(recipient)?;
        let before = local.messages.len();
        local.messages.retain(|m| !message_ids.contains(&m.message_id));
        let dropped = before - local.messages.len();
        if dropped > 0 {
            local.updated_at = Utc::now();
            self.records
                .put_json(QUEUES_NAMESPACE, recipient.as_str(), &local)?;
            debug!(recipient = %recipient.short(), dropped, "offline entries acknowledged");
        }
        Ok(dropped)
    }

    /// Entries other peers queued for us, highest priority first, expired
    /// ones left out.
    pub async fn fetch_own(&self) -> Result<Vec<QueuedMessage>> {
        self.fetch_own_at(Utc::now()).await
    }

    pub async fn fetch_own_at(&self, now: DateTime<Utc>) -> Result<Vec<QueuedMessage>> {
        let own = self.keystore.wallet()?;
        let record = self.read_remote(&Self::directory_key(&own), &own).await?;
        let mut entries: Vec<QueuedMessage> = record
            .messages
            .into_iter()
            .filter(|m| !m.is_expired_at(now) && m.recipient == own)
            .collect();
        entries.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.queued_at.cmp(&b.queued_at))
        });
        Ok(entries)
    }

    /// Remove `processed` entries (and anything expired) from our directory
    /// record.
    pub async fn clear_own(&self, processed: &[String]) -> Result<()> {
        let own = self.keystore.wallet()?;
        let _guard = self.locks.lock(&own).await;
        let key = Self::directory_key(&own);
        let mut record = self.read_remote(&key, &own).await?;
        let now = Utc::now();
        let before = record.messages.len();
        record
            .messages
            .retain(|m| !m.is_expired_at(now) && !processed.contains(&m.id));
        if record.messages.len() != before {
            record.updated_at = now;
            self.write_remote(&key, &record).await?;
        }
        Ok(())
    }

    /// Drop expired entries from every local queue.
    pub fn prune_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut pruned = 0;
        for mut record in self.records.list_json::<OfflineQueueRecord>(QUEUES_NAMESPACE)? {
            let before = record.messages.len();
            record.messages.retain(|m| !m.is_expired_at(now));
            if record.messages.len() != before {
                pruned += before - record.messages.len();
                self.records
                    .put_json(QUEUES_NAMESPACE, record.recipient.as_str(), &record)?;
            }
        }
        Ok(pruned)
    }

    fn directory_key(wallet: &WalletAddress) -> String {
        format!("{DIR_OFFLINE_PREFIX}{wallet}")
    }

    fn local_record(&self, recipient: &WalletAddress) -> Result<OfflineQueueRecord> {
        Ok(self
            .records
            .get_json(QUEUES_NAMESPACE, recipient.as_str())?
            .unwrap_or_else(|| OfflineQueueRecord::empty(recipient.clone())))
    }

    async fn read_remote(
        &self,
        key: &str,
        recipient: &WalletAddress,
    ) -> std::result::Result<OfflineQueueRecord, DirectoryError> {
        let raw = tokio::time::timeout(self.timeout, self.directory.lookup(key))
            .await
            .map_err(|_| DirectoryError::Timeout)??;
        let Some(raw) = raw else {
            return Ok(OfflineQueueRecord::empty(recipient.clone()));
        };
        match serde_json::from_slice::<OfflineQueueRecord>(&raw) {
            Ok(record) if &record.recipient == recipient => Ok(record),
            Ok(_) => {
                warn!(key, "offline record names another recipient, replacing it");
                Ok(OfflineQueueRecord::empty(recipient.clone()))
            }
            Err(e) => {
                warn!(key, error = %e, "malformed offline record, replacing it");
                Ok(OfflineQueueRecord::empty(recipient.clone()))
            }
        }
    }

    async fn write_remote(
        &self,
        key: &str,
        record: &OfflineQueueRecord,
    ) -> std::result::Result<(), DirectoryError> {
        let bytes = serde_json::to_vec(record).map_err(|e| DirectoryError::Malformed {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        tokio::time::timeout(self.timeout, self.directory.announce(key, bytes))
            .await
            .map_err(|_| DirectoryError::Timeout)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDirectory;
    use cairn_store::MemoryRecordStore;

    fn wallet(c: char) -> WalletAddress {
        WalletAddress::parse(&format!("0x{}", c.to_string().repeat(40))).unwrap()
    }

    fn queue(
        dir: &tempfile::TempDir,
        w: char,
        directory: Arc<MemoryDirectory>,
        ttl: chrono::Duration,
    ) -> OfflineMessageQueue {
        let records = Arc::new(MemoryRecordStore::new());
        let ks = Arc::new(KeyStore::new(records.clone(), dir.path().join(format!("{w}.key")), "pw"));
        ks.generate_identity(wallet(w), None).unwrap();
        OfflineMessageQueue::new(ks, records, directory, ttl, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_enqueue_then_recipient_fetches_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let directory = MemoryDirectory::new();
        let alice = queue(&dir, 'a', directory.clone(), chrono::Duration::days(7));
        let bob = queue(&dir, 'b', directory.clone(), chrono::Duration::days(7));

        let conv = ConversationId::direct(&wallet('a'), &wallet('b'));
        let cid = Cid::for_bytes(b"m1");
        let mid = MessageId::new();
        alice.enqueue(&wallet('b'), mid, &cid, &conv).await.unwrap();
        // same message twice is one entry
        alice.enqueue(&wallet('b'), mid, &cid, &conv).await.unwrap();
        assert_eq!(alice.pending_for(&wallet('b')).unwrap().len(), 1);

        let own = bob.fetch_own().await.unwrap();
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].message_cid, cid);
        assert_eq!(own[0].sender, wallet('a'));

        bob.clear_own(&[own[0].id.clone()]).await.unwrap();
        assert!(bob.fetch_own().await.unwrap().is_empty());

        assert_eq!(alice.acknowledge(&wallet('b'), &[mid]).await.unwrap(), 1);
        assert!(alice.pending_for(&wallet('b')).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_entries_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let directory = MemoryDirectory::new();
        let alice = queue(&dir, 'a', directory.clone(), chrono::Duration::days(7));
        let bob = queue(&dir, 'b', directory.clone(), chrono::Duration::days(7));

        let conv = ConversationId::direct(&wallet('a'), &wallet('b'));
        alice
            .enqueue(&wallet('b'), MessageId::new(), &Cid::for_bytes(b"m"), &conv)
            .await
            .unwrap();

        let in_eight_days = Utc::now() + chrono::Duration::days(8);
        assert!(bob.fetch_own_at(in_eight_days).await.unwrap().is_empty());
        assert_eq!(bob.fetch_own().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_senders_merge_into_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let directory = MemoryDirectory::new();
        let alice = queue(&dir, 'a', directory.clone(), chrono::Duration::days(7));
        let carol = queue(&dir, 'c', directory.clone(), chrono::Duration::days(7));
        let bob = queue(&dir, 'b', directory.clone(), chrono::Duration::days(7));

        let ab = ConversationId::direct(&wallet('a'), &wallet('b'));
        let cb = ConversationId::direct(&wallet('c'), &wallet('b'));
        alice
            .enqueue(&wallet('b'), MessageId::new(), &Cid::for_bytes(b"1"), &ab)
            .await
            .unwrap();
        carol
            .enqueue(&wallet('b'), MessageId::new(), &Cid::for_bytes(b"2"), &cb)
            .await
            .unwrap();

        let own = bob.fetch_own().await.unwrap();
        assert_eq!(own.len(), 2);
    }

    #[tokio::test]
    async fn test_prune_expired_local() {
        let dir = tempfile::tempdir().unwrap();
        let directory = MemoryDirectory::new();
        let alice = queue(&dir, 'a', directory, chrono::Duration::seconds(-1));
        let conv = ConversationId::direct(&wallet('a'), &wallet('b'));
        alice
            .enqueue(&wallet('b'), MessageId::new(), &Cid::for_bytes(b"m"), &conv)
            .await
            .unwrap();
        assert!(alice.pending_for(&wallet('b')).unwrap().is_empty());
        assert_eq!(alice.prune_expired().unwrap(), 1);
    }
}
