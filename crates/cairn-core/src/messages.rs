//! Message engine: encrypt, sign, link, pin, publish; and the reverse on
//! receipt.
//!
//! A send goes through these states, each persisted before the next network
//! step so a crash never loses a message:
//!
//! ```text
//! sending ──pin──▶ pinned ──publish──▶ sent ──receipt──▶ delivered ──▶ read
//!    └──────────── retries exhausted ──────────▶ failed
//! ```
//!
//! Heads are linearized per conversation: concurrent sends in one
//! conversation queue on the head lock and each links to its predecessor.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use cairn_shared::capability::{ContentStore, DirectoryLookup, PubSubTransport};
use cairn_shared::constants::DIR_MANIFEST_PREFIX;
use cairn_shared::crypto::{self, parse_nonce, sha256, Nonce, SymmetricKey};
use cairn_shared::error::{ContentError, CryptoError};
use cairn_shared::locks::KeyedLocks;
use cairn_shared::protocol::{MessageNotice, MessageType, Receipt, ReceiptKind, WireMessage};
use cairn_shared::types::{Cid, ConversationId, MessageId, WalletAddress};
use cairn_store::records::RecordStoreExt;
use cairn_store::RecordStore;

use crate::config::EngineConfig;
use crate::conversations::{Conversation, ConversationStore, EncryptionType, MessagePreview};
use crate::dag::{ConversationManifest, DagNode, MessageEnvelope, WrappedKey, ALGORITHM_GROUP, ALGORITHM_PAIRWISE};
use crate::error::{ConversationError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::keystore::KeyStore;
use crate::offline::OfflineMessageQueue;
use crate::presence::PresenceBus;
use crate::Capabilities;

pub const PINS_NAMESPACE: &str = "pins";

pub fn messages_namespace(conversation: &ConversationId) -> String {
    format!("messages/{conversation}")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sending,
    Pinned,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    fn rank(self) -> u8 {
        match self {
            DeliveryStatus::Sending => 0,
            DeliveryStatus::Pinned => 1,
            DeliveryStatus::Sent => 2,
            DeliveryStatus::Delivered => 3,
            DeliveryStatus::Read => 4,
            DeliveryStatus::Failed => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Read | DeliveryStatus::Failed)
    }

    /// Statuses only move forward; `Failed` is reachable from any
    /// non-terminal status.
    pub fn can_transition_to(self, next: DeliveryStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == DeliveryStatus::Failed || next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(flatten)]
    pub envelope: MessageEnvelope,
    pub delivery_status: DeliveryStatus,
    pub cid: Option<Cid>,
    pub depth: Option<u64>,
    #[serde(default)]
    pub pin_attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl ChatMessage {
    fn draft(envelope: MessageEnvelope) -> Self {
        Self {
            envelope,
            delivery_status: DeliveryStatus::Sending,
            cid: None,
            depth: None,
            pin_attempts: 0,
            last_attempt_at: None,
        }
    }

    pub fn id(&self) -> MessageId {
        self.envelope.id
    }

    pub fn advance(&mut self, next: DeliveryStatus) -> bool {
        if self.delivery_status.can_transition_to(next) {
            self.delivery_status = next;
            true
        } else {
            false
        }
    }

    fn preview(&self) -> MessagePreview {
        MessagePreview {
            message_id: self.envelope.id,
            sender: self.envelope.sender.clone(),
            message_type: self.envelope.message_type,
            timestamp: self.envelope.timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DecryptedMessage {
    #[serde(flatten)]
    pub message: ChatMessage,
    /// `None` when the content could not be decrypted or verified.
    pub decrypted_content: Option<String>,
    pub edited: bool,
}

/// Local record of a pinned node, keyed by CID.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessagePin {
    pub cid: Cid,
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub depth: u64,
    pub previous: Option<Cid>,
    pub pinned_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SendOptions {
    pub message_type: MessageType,
    pub reply_to: Option<MessageId>,
    pub thread_id: Option<MessageId>,
    pub expires_in: Option<chrono::Duration>,
    pub references: Option<MessageId>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            message_type: MessageType::Text,
            reply_to: None,
            thread_id: None,
            expires_in: None,
            references: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendResult {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub cid: Option<Cid>,
    pub status: DeliveryStatus,
    /// Recipients the message was queued for because they looked offline
    pub queued_for: Vec<WalletAddress>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub retried: usize,
    pub pinned: usize,
    pub failed: usize,
}

/// Result of importing one remote node.
#[derive(Debug, Clone)]
pub struct ImportedNode {
    pub message: ChatMessage,
    pub previous: Option<Cid>,
    /// False when the message was already stored locally.
    pub fresh: bool,
}

struct Sealed {
    ciphertext: Vec<u8>,
    nonce: Nonce,
    algorithm: &'static str,
    wrapped_keys: Vec<WrappedKey>,
}

pub struct MessageEngine {
    keystore: Arc<KeyStore>,
    conversations: Arc<ConversationStore>,
    presence: Arc<PresenceBus>,
    offline: Arc<OfflineMessageQueue>,
    records: Arc<dyn RecordStore>,
    content: Arc<dyn ContentStore>,
    pubsub: Arc<dyn PubSubTransport>,
    directory: Arc<dyn DirectoryLookup>,
    events: EventBus,
    config: EngineConfig,
    head_locks: KeyedLocks<ConversationId>,
    write_lock: Mutex<()>,
}

impl MessageEngine {
    pub fn new(
        keystore: Arc<KeyStore>,
        conversations: Arc<ConversationStore>,
        presence: Arc<PresenceBus>,
        offline: Arc<OfflineMessageQueue>,
        caps: &Capabilities,
        events: EventBus,
        config: EngineConfig,
    ) -> Self {
        Self {
            keystore,
            conversations,
            presence,
            offline,
            records: caps.records.clone(),
            content: caps.content.clone(),
            pubsub: caps.pubsub.clone(),
            directory: caps.directory.clone(),
            events,
            config,
            head_locks: KeyedLocks::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// Encrypt, sign, pin and publish `plaintext`.
    ///
    /// A pin failure is not an error: the message stays `sending` and
    /// [`retry_pending`](Self::retry_pending) picks it up. Publish failures
    /// are logged; the recipient finds the message on its next sync.
    pub async fn send(
        &self,
        conversation_id: &ConversationId,
        plaintext: &str,
        options: SendOptions,
    ) -> Result<SendResult> {
        let identity = self.keystore.identity()?;
        let mut conversation = self.conversations.require(conversation_id)?;
        if !conversation.unresolved().is_empty() {
            conversation = self.conversations.refresh_keys(conversation_id).await?;
        }

        let hash = sha256(plaintext.as_bytes());
        let signature = self.keystore.sign(&hash)?;
        let sealed = self.seal(&conversation, &identity.wallet_address, plaintext.as_bytes())?;

        let now = Utc::now();
        let expires_in = options.expires_in.or_else(|| {
            conversation
                .settings
                .default_expires_in_secs
                .map(chrono::Duration::seconds)
        });
        let envelope = MessageEnvelope {
            id: MessageId::new(),
            conversation_id: conversation.id.clone(),
            conversation_type: conversation.conversation_type,
            sender: identity.wallet_address.clone(),
            recipients: conversation
                .others(&identity.wallet_address)
                .map(|p| p.wallet_address.clone())
                .collect(),
            encrypted_content: hex::encode(&sealed.ciphertext),
            nonce: hex::encode(sealed.nonce),
            encryption_algorithm: sealed.algorithm.to_string(),
            wrapped_keys: sealed.wrapped_keys,
            message_type: options.message_type,
            reply_to: options.reply_to,
            thread_id: options.thread_id,
            references: options.references,
            expires_at: expires_in.map(|d| now + d),
            timestamp: now,
            signature,
            message_hash: hex::encode(hash),
        };

        let mut message = ChatMessage::draft(envelope);
        self.store(&message)?;
        debug!(conversation = %conversation_id, message = %message.id(), "message drafted");

        if let Err(e) = self.pin(&mut message).await {
            warn!(conversation = %conversation_id, message = %message.id(), error = %e, "pin failed, will retry");
            let message = self.record_failed_attempt(&message)?;
            self.events.publish(EngineEvent::MessageSent {
                conversation_id: conversation_id.clone(),
                message_id: message.id(),
                cid: None,
            });
            return Ok(SendResult {
                message_id: message.id(),
                conversation_id: conversation_id.clone(),
                cid: None,
                status: message.delivery_status,
                queued_for: Vec::new(),
            });
        }

        let queued_for = self.deliver(&message).await;
        let status = self
            .find(conversation_id, &message.id())?
            .map_or(message.delivery_status, |m| m.delivery_status);

        self.events.publish(EngineEvent::MessageSent {
            conversation_id: conversation_id.clone(),
            message_id: message.id(),
            cid: message.cid.clone(),
        });
        Ok(SendResult {
            message_id: message.id(),
            conversation_id: conversation_id.clone(),
            cid: message.cid,
            status,
            queued_for,
        })
    }

    /// Send an edit of one of our own messages.
    pub async fn edit(
        &self,
        conversation_id: &ConversationId,
        original: MessageId,
        plaintext: &str,
    ) -> Result<SendResult> {
        self.require_own(conversation_id, original)?;
        let options = SendOptions {
            message_type: MessageType::Edit,
            references: Some(original),
            ..Default::default()
        };
        self.send(conversation_id, plaintext, options).await
    }

    /// Retract one of our own messages. The original node stays in the
    /// chain; readers hide it.
    pub async fn delete(&self, conversation_id: &ConversationId, original: MessageId) -> Result<SendResult> {
        self.require_own(conversation_id, original)?;
        let options = SendOptions {
            message_type: MessageType::Delete,
            references: Some(original),
            ..Default::default()
        };
        self.send(conversation_id, "", options).await
    }

    /// Every message of a conversation with its plaintext where it could be
    /// decrypted and verified. Undecryptable messages come back with
    /// `decrypted_content: None`; expired ones are left out. Edits and
    /// deletions are applied to the messages they reference.
    pub fn get_decrypted(&self, conversation_id: &ConversationId) -> Result<Vec<DecryptedMessage>> {
        let conversation = self.conversations.require(conversation_id)?;
        let local = self.keystore.wallet()?;
        let now = Utc::now();

        let mut out: Vec<DecryptedMessage> = Vec::new();
        let mut edits: HashMap<MessageId, (WalletAddress, String)> = HashMap::new();
        let mut deleted: HashSet<(MessageId, WalletAddress)> = HashSet::new();

        for message in self.list_messages(conversation_id)? {
            if message.envelope.is_expired_at(now) {
                continue;
            }
            let content = match self.open(&conversation, &local, &message.envelope) {
                Ok(plain) => String::from_utf8(plain).ok(),
                Err(e) => {
                    debug!(message = %message.id(), error = %e, "message unreadable");
                    None
                }
            };

            match (message.envelope.message_type, message.envelope.references) {
                (MessageType::Edit, Some(original)) => {
                    if let Some(text) = content {
                        edits.insert(original, (message.envelope.sender.clone(), text));
                    }
                    continue;
                }
                (MessageType::Delete, Some(original)) => {
                    deleted.insert((original, message.envelope.sender.clone()));
                    continue;
                }
                _ => {}
            }

            out.push(DecryptedMessage {
                message,
                decrypted_content: content,
                edited: false,
            });
        }

        out.retain(|d| !deleted.contains(&(d.message.id(), d.message.envelope.sender.clone())));
        for d in &mut out {
            if let Some((sender, text)) = edits.get(&d.message.id()) {
                if *sender == d.message.envelope.sender {
                    d.decrypted_content = Some(text.clone());
                    d.edited = true;
                }
            }
        }
        Ok(out)
    }

    /// Stored messages in chain order; unpinned drafts last.
    pub fn list_messages(&self, conversation_id: &ConversationId) -> Result<Vec<ChatMessage>> {
        let mut messages: Vec<ChatMessage> = self
            .records
            .list_json(&messages_namespace(conversation_id))?;
        messages.sort_by(|a, b| {
            a.depth
                .unwrap_or(u64::MAX)
                .cmp(&b.depth.unwrap_or(u64::MAX))
                .then(a.envelope.timestamp.cmp(&b.envelope.timestamp))
        });
        Ok(messages)
    }

    pub fn find(&self, conversation_id: &ConversationId, id: &MessageId) -> Result<Option<ChatMessage>> {
        Ok(self
            .records
            .get_json(&messages_namespace(conversation_id), &id.to_string())?)
    }

    pub fn pin_record(&self, cid: &Cid) -> Result<Option<MessagePin>> {
        Ok(self.records.get_json(PINS_NAMESPACE, cid.as_str())?)
    }

    /// Handle a notice from the wire. Returns the message if it was new.
    pub async fn handle_notice(&self, notice: &MessageNotice) -> Result<Option<ChatMessage>> {
        let local = self.keystore.wallet()?;
        if notice.sender == local {
            return Ok(None);
        }
        if self.find(&notice.conversation_id, &notice.message_id)?.is_some() {
            return Ok(None);
        }
        let imported = self.import_node(&notice.cid).await?;
        if imported.message.envelope.sender != notice.sender {
            warn!(cid = %notice.cid, "notice sender does not match the node");
        }
        Ok(imported.fresh.then_some(imported.message))
    }

    /// Fetch a node by CID, verify it, and store its message. The head
    /// moves when the node has greater depth than the current head, or the
    /// same depth and a smaller CID.
    pub async fn import_node(&self, cid: &Cid) -> Result<ImportedNode> {
        let value = self.get_block(cid).await?;
        if !cid.matches(&value) {
            return Err(ContentError::Mismatch(cid.to_string()).into());
        }
        let node = DagNode::from_value(value)?;
        let envelope = &node.message;
        let local = self.keystore.wallet()?;

        let mut members = envelope.recipients.clone();
        members.push(envelope.sender.clone());
        let conversation = self
            .conversations
            .adopt(&envelope.conversation_id, envelope.conversation_type, &members)
            .await?;
        let signing_key = self.signing_key_of(&conversation, &envelope.sender).await?;
        node.verify(&signing_key)?;

        if let Some(existing) = self.find(&conversation.id, &envelope.id)? {
            return Ok(ImportedNode {
                message: existing,
                previous: node.previous,
                fresh: false,
            });
        }

        let from_peer = envelope.sender != local;
        let message = ChatMessage {
            envelope: node.message.clone(),
            delivery_status: if from_peer {
                DeliveryStatus::Delivered
            } else {
                DeliveryStatus::Sent
            },
            cid: Some(cid.clone()),
            depth: Some(node.depth),
            pin_attempts: 0,
            last_attempt_at: None,
        };
        self.store(&message)?;
        self.records.put_json(
            PINS_NAMESPACE,
            cid.as_str(),
            &MessagePin {
                cid: cid.clone(),
                message_id: message.id(),
                conversation_id: conversation.id.clone(),
                depth: node.depth,
                previous: node.previous.clone(),
                pinned_at: Utc::now(),
            },
        )?;
        self.consider_head(&conversation.id, cid, node.depth, message.preview())
            .await?;

        if from_peer {
            self.conversations.record_unread(&conversation.id)?;
            info!(conversation = %conversation.id, sender = %envelope.sender.short(), cid = %cid, "message received");
            self.events.publish(EngineEvent::MessageReceived {
                conversation_id: conversation.id.clone(),
                message_id: message.id(),
                sender: envelope.sender.clone(),
                cid: cid.clone(),
            });
            self.send_receipt(&conversation.id, vec![message.id()], ReceiptKind::Delivered)
                .await;
        }

        Ok(ImportedNode {
            message,
            previous: node.previous,
            fresh: true,
        })
    }

    /// Apply a delivery or read receipt to our own messages.
    pub async fn handle_receipt(&self, receipt: &Receipt) -> Result<usize> {
        let local = self.keystore.wallet()?;
        if receipt.sender == local {
            return Ok(0);
        }
        let status = match receipt.status {
            ReceiptKind::Delivered => DeliveryStatus::Delivered,
            ReceiptKind::Read => DeliveryStatus::Read,
        };

        let mut applied = 0;
        for id in &receipt.message_ids {
            let updated = self.update(&receipt.conversation_id, id, |m| {
                m.envelope.sender == local
                    && m.envelope.recipients.contains(&receipt.sender)
                    && m.advance(status)
            })?;
            if updated.is_some() {
                applied += 1;
                self.events.publish(EngineEvent::MessageStatus {
                    conversation_id: receipt.conversation_id.clone(),
                    message_id: *id,
                    status,
                });
            }
        }

        if let Err(e) = self
            .offline
            .acknowledge(&receipt.sender, &receipt.message_ids)
            .await
        {
            warn!(error = %e, "could not drop acknowledged offline entries");
        }
        Ok(applied)
    }

    /// Mark every received message as read, zero the unread count and tell
    /// the senders.
    pub async fn mark_read(&self, conversation_id: &ConversationId) -> Result<usize> {
        let local = self.keystore.wallet()?;
        let unread: Vec<MessageId> = self
            .list_messages(conversation_id)?
            .into_iter()
            .filter(|m| m.envelope.sender != local && m.delivery_status == DeliveryStatus::Delivered)
            .map(|m| m.id())
            .collect();

        for id in &unread {
            self.update(conversation_id, id, |m| m.advance(DeliveryStatus::Read))?;
        }
        self.conversations.mark_read(conversation_id)?;
        if !unread.is_empty() {
            self.send_receipt(conversation_id, unread.clone(), ReceiptKind::Read)
                .await;
        }
        Ok(unread.len())
    }

    /// Re-attempt pins of our messages still `sending`, honouring the
    /// backoff schedule. Messages past the retry limit become `failed`.
    pub async fn retry_pending(&self) -> Result<RetryReport> {
        let local = self.keystore.wallet()?;
        let now = Utc::now();
        let mut report = RetryReport::default();

        for conversation in self.conversations.list() {
            for message in self.list_messages(&conversation.id)? {
                if message.delivery_status != DeliveryStatus::Sending || message.envelope.sender != local {
                    continue;
                }
                if message.pin_attempts >= self.config.pin_retry_limit {
                    self.fail(&message, "pin retries exhausted")?;
                    report.failed += 1;
                    continue;
                }
                if let Some(last) = message.last_attempt_at {
                    let wait = chrono::Duration::from_std(self.config.backoff_after(message.pin_attempts))
                        .unwrap_or_else(|_| chrono::Duration::zero());
                    if now < last + wait {
                        continue;
                    }
                }

                report.retried += 1;
                let mut message = message;
                match self.pin(&mut message).await {
                    Ok(()) => {
                        report.pinned += 1;
                        self.deliver(&message).await;
                        self.events.publish(EngineEvent::MessageSent {
                            conversation_id: conversation.id.clone(),
                            message_id: message.id(),
                            cid: message.cid.clone(),
                        });
                    }
                    Err(e) => {
                        warn!(message = %message.id(), attempts = message.pin_attempts + 1, error = %e, "pin retry failed");
                        let message = self.record_failed_attempt(&message)?;
                        if message.pin_attempts >= self.config.pin_retry_limit {
                            self.fail(&message, &e.to_string())?;
                            report.failed += 1;
                        }
                    }
                }
            }
        }
        Ok(report)
    }

    fn seal(&self, conversation: &Conversation, local: &WalletAddress, plaintext: &[u8]) -> Result<Sealed> {
        match conversation.encryption_type {
            EncryptionType::Pairwise => {
                let recipient = conversation.others(local).next().ok_or_else(|| {
                    ConversationError::InvalidParticipants("direct conversation without a peer".into())
                })?;
                if recipient.public_key.is_empty() {
                    return Err(ConversationError::RecipientKeyUnknown(recipient.wallet_address.clone()).into());
                }
                let (ciphertext, nonce) = self.keystore.encrypt_for(plaintext, &recipient.public_key)?;
                Ok(Sealed {
                    ciphertext,
                    nonce,
                    algorithm: ALGORITHM_PAIRWISE,
                    wrapped_keys: Vec::new(),
                })
            }
            EncryptionType::GroupWrapped => {
                if let Some(missing) = conversation.participants.iter().find(|p| p.public_key.is_empty()) {
                    return Err(ConversationError::RecipientKeyUnknown(missing.wallet_address.clone()).into());
                }
                let content_key = crypto::generate_symmetric_key();
                let (ciphertext, nonce) = crypto::encrypt_detached(&content_key, plaintext)?;
                let wrapped_keys = conversation
                    .participants
                    .iter()
                    .map(|p| {
                        let (key, nonce) = self.keystore.encrypt_for(&content_key, &p.public_key)?;
                        Ok(WrappedKey {
                            wallet: p.wallet_address.clone(),
                            key: hex::encode(key),
                            nonce: hex::encode(nonce),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Sealed {
                    ciphertext,
                    nonce,
                    algorithm: ALGORITHM_GROUP,
                    wrapped_keys,
                })
            }
        }
    }

    fn open(
        &self,
        conversation: &Conversation,
        local: &WalletAddress,
        envelope: &MessageEnvelope,
    ) -> std::result::Result<Vec<u8>, CryptoError> {
        let sender = conversation
            .participant(&envelope.sender)
            .filter(|p| p.has_keys())
            .ok_or(CryptoError::DecryptionFailed)?;
        let ciphertext = hex::decode(&envelope.encrypted_content)
            .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
        let nonce = parse_nonce(&envelope.nonce)?;

        let plaintext = match envelope.encryption_algorithm.as_str() {
            ALGORITHM_PAIRWISE => {
                let peer_key = if &envelope.sender == local {
                    conversation
                        .others(local)
                        .next()
                        .map(|p| p.public_key.as_str())
                        .ok_or(CryptoError::DecryptionFailed)?
                } else {
                    sender.public_key.as_str()
                };
                self.keystore.decrypt_from(&ciphertext, &nonce, peer_key)?
            }
            ALGORITHM_GROUP => {
                let wrapped = envelope
                    .wrapped_key_for(local)
                    .ok_or(CryptoError::DecryptionFailed)?;
                let sealed_key = hex::decode(&wrapped.key)
                    .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
                let key_nonce = parse_nonce(&wrapped.nonce)?;
                let key: SymmetricKey = self
                    .keystore
                    .decrypt_from(&sealed_key, &key_nonce, &sender.public_key)?
                    .try_into()
                    .map_err(|_| CryptoError::InvalidKeyLength)?;
                crypto::decrypt_detached(&key, &ciphertext, &nonce)?
            }
            _ => return Err(CryptoError::DecryptionFailed),
        };

        if !envelope.verify_plaintext(&plaintext) {
            return Err(CryptoError::InvalidSignature);
        }
        envelope.verify_signature(&sender.signing_key)?;
        Ok(plaintext)
    }

    /// Build the node on top of the current head, pin it and move the head.
    async fn pin(&self, message: &mut ChatMessage) -> Result<()> {
        let conversation_id = message.envelope.conversation_id.clone();
        let _guard = self.head_locks.lock(&conversation_id).await;

        let conversation = self.conversations.require(&conversation_id)?;
        let previous = conversation.head_cid.clone();
        let depth = if previous.is_some() {
            conversation.head_depth + 1
        } else {
            0
        };
        let node = DagNode::build(message.envelope.clone(), previous.clone(), depth, &self.keystore)?;
        let cid = self.put_block(&node.to_value()?).await?;

        let now = Utc::now();
        let pinned_cid = cid.clone();
        let updated = self.update(&conversation_id, &message.id(), move |m| {
            m.cid = Some(pinned_cid);
            m.depth = Some(depth);
            m.last_attempt_at = Some(now);
            m.advance(DeliveryStatus::Pinned);
            true
        })?;
        if let Some(updated) = updated {
            *message = updated;
        }

        self.records.put_json(
            PINS_NAMESPACE,
            cid.as_str(),
            &MessagePin {
                cid: cid.clone(),
                message_id: message.id(),
                conversation_id: conversation_id.clone(),
                depth,
                previous,
                pinned_at: now,
            },
        )?;
        let conversation = self
            .conversations
            .update_head(&conversation_id, cid.clone(), depth, Some(message.preview()))?;
        debug!(conversation = %conversation_id, cid = %cid, depth, "message pinned");
        self.events.publish(EngineEvent::MessageStatus {
            conversation_id: conversation_id.clone(),
            message_id: message.id(),
            status: DeliveryStatus::Pinned,
        });

        if let Err(e) = self.publish_manifest(&conversation).await {
            warn!(conversation = %conversation_id, error = %e, "manifest publish failed");
        }
        Ok(())
    }

    /// Announce a pinned message in real time and queue it for recipients
    /// that look offline. Returns the wallets it was queued for.
    async fn deliver(&self, message: &ChatMessage) -> Vec<WalletAddress> {
        let envelope = &message.envelope;
        let Some(cid) = message.cid.clone() else {
            return Vec::new();
        };

        let notice = WireMessage::MessageNotice(MessageNotice {
            conversation_id: envelope.conversation_id.clone(),
            sender: envelope.sender.clone(),
            message_id: envelope.id,
            cid: cid.clone(),
            message_type: envelope.message_type,
            timestamp: envelope.timestamp,
        });
        match notice.to_bytes() {
            Ok(bytes) => {
                let mut published = self
                    .publish(&envelope.conversation_id.to_topic(), bytes.clone())
                    .await;
                // first message: recipients are not on the conversation topic yet
                if message.depth == Some(0) {
                    for recipient in &envelope.recipients {
                        published |= self.publish(&recipient.inbox_topic(), bytes.clone()).await;
                    }
                }
                if published {
                    match self.update(&envelope.conversation_id, &envelope.id, |m| m.advance(DeliveryStatus::Sent)) {
                        Ok(Some(_)) => self.events.publish(EngineEvent::MessageStatus {
                            conversation_id: envelope.conversation_id.clone(),
                            message_id: envelope.id,
                            status: DeliveryStatus::Sent,
                        }),
                        Ok(None) => {}
                        Err(e) => warn!(message = %envelope.id, error = %e, "could not record sent status"),
                    }
                }
            }
            Err(e) => warn!(message = %envelope.id, error = %e, "notice encode failed"),
        }

        let mut queued_for = Vec::new();
        for recipient in &envelope.recipients {
            if self.presence.check_online(recipient) {
                continue;
            }
            match self
                .offline
                .enqueue(recipient, envelope.id, &cid, &envelope.conversation_id)
                .await
            {
                Ok(_) => queued_for.push(recipient.clone()),
                Err(e) => warn!(recipient = %recipient.short(), error = %e, "offline enqueue failed"),
            }
        }
        queued_for
    }

    async fn publish_manifest(&self, conversation: &Conversation) -> Result<()> {
        let signer = self.keystore.wallet()?;
        let Some(manifest) = ConversationManifest::snapshot(conversation, signer) else {
            return Ok(());
        };
        let manifest = manifest.sign(&self.keystore)?;
        let cid = self.put_block(&serde_json::to_value(&manifest)?).await?;
        let key = format!("{DIR_MANIFEST_PREFIX}{}", conversation.id);
        tokio::time::timeout(
            self.timeout(),
            self.directory.announce(&key, cid.as_str().as_bytes().to_vec()),
        )
        .await
        .map_err(|_| cairn_shared::error::DirectoryError::Timeout)??;
        debug!(conversation = %conversation.id, manifest = %cid, "manifest announced");
        Ok(())
    }

    async fn consider_head(
        &self,
        conversation_id: &ConversationId,
        cid: &Cid,
        depth: u64,
        preview: MessagePreview,
    ) -> Result<()> {
        let _guard = self.head_locks.lock(conversation_id).await;
        let conversation = self.conversations.require(conversation_id)?;
        let wins = match &conversation.head_cid {
            None => true,
            Some(head) => {
                depth > conversation.head_depth || (depth == conversation.head_depth && cid < head)
            }
        };
        if wins {
            self.conversations
                .update_head(conversation_id, cid.clone(), depth, Some(preview))?;
        } else if depth == 0 {
            self.conversations.set_genesis(conversation_id, cid.clone())?;
        }
        Ok(())
    }

    async fn signing_key_of(&self, conversation: &Conversation, wallet: &WalletAddress) -> Result<String> {
        if let Some(p) = conversation.participant(wallet).filter(|p| p.has_keys()) {
            return Ok(p.signing_key.clone());
        }
        let refreshed = self.conversations.refresh_keys(&conversation.id).await?;
        refreshed
            .participant(wallet)
            .filter(|p| p.has_keys())
            .map(|p| p.signing_key.clone())
            .ok_or_else(|| ConversationError::RecipientKeyUnknown(wallet.clone()).into())
    }

    async fn send_receipt(&self, conversation_id: &ConversationId, message_ids: Vec<MessageId>, status: ReceiptKind) {
        let Ok(sender) = self.keystore.wallet() else {
            return;
        };
        let receipt = WireMessage::Receipt(Receipt {
            conversation_id: conversation_id.clone(),
            sender,
            message_ids,
            status,
            timestamp: Utc::now(),
        });
        match receipt.to_bytes() {
            Ok(bytes) => {
                self.publish(&conversation_id.to_topic(), bytes).await;
            }
            Err(e) => debug!(error = %e, "receipt encode failed"),
        }
    }

    async fn publish(&self, topic: &str, bytes: Vec<u8>) -> bool {
        match tokio::time::timeout(self.timeout(), self.pubsub.publish(topic, bytes)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(topic, error = %e, "publish failed");
                false
            }
            Err(_) => {
                warn!(topic, "publish timed out");
                false
            }
        }
    }

    async fn put_block(&self, value: &Value) -> std::result::Result<Cid, ContentError> {
        tokio::time::timeout(self.timeout(), self.content.put(value))
            .await
            .map_err(|_| ContentError::Timeout)?
    }

    async fn get_block(&self, cid: &Cid) -> std::result::Result<Value, ContentError> {
        tokio::time::timeout(self.timeout(), self.content.get(cid))
            .await
            .map_err(|_| ContentError::Timeout)?
    }

    fn timeout(&self) -> Duration {
        self.config.network_timeout
    }

    fn require_own(&self, conversation_id: &ConversationId, id: MessageId) -> Result<ChatMessage> {
        let local = self.keystore.wallet()?;
        self.find(conversation_id, &id)?
            .filter(|m| m.envelope.sender == local)
            .ok_or_else(|| ConversationError::MessageNotFound(id).into())
    }

    fn record_failed_attempt(&self, message: &ChatMessage) -> Result<ChatMessage> {
        let now = Utc::now();
        let updated = self.update(&message.envelope.conversation_id, &message.id(), |m| {
            m.pin_attempts += 1;
            m.last_attempt_at = Some(now);
            true
        })?;
        Ok(updated.unwrap_or_else(|| message.clone()))
    }

    fn fail(&self, message: &ChatMessage, reason: &str) -> Result<()> {
        let changed = self.update(&message.envelope.conversation_id, &message.id(), |m| {
            m.advance(DeliveryStatus::Failed)
        })?;
        if changed.is_some() {
            warn!(message = %message.id(), reason, "message failed");
            self.events.publish(EngineEvent::MessageFailed {
                conversation_id: message.envelope.conversation_id.clone(),
                message_id: message.id(),
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    fn store(&self, message: &ChatMessage) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.records.put_json(
            &messages_namespace(&message.envelope.conversation_id),
            &message.id().to_string(),
            message,
        )?;
        Ok(())
    }

    /// Read-modify-write of one stored message. `f` returns whether it
    /// changed anything; the updated message is returned only then.
    fn update(
        &self,
        conversation_id: &ConversationId,
        id: &MessageId,
        f: impl FnOnce(&mut ChatMessage) -> bool,
    ) -> Result<Option<ChatMessage>> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let namespace = messages_namespace(conversation_id);
        let Some(mut message) = self
            .records
            .get_json::<ChatMessage>(&namespace, &id.to_string())?
        else {
            return Ok(None);
        };
        if !f(&mut message) {
            return Ok(None);
        }
        self.records.put_json(&namespace, &id.to_string(), &message)?;
        Ok(Some(message))
    }
}
