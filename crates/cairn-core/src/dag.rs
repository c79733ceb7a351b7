//! Content-addressed message chain.
//!
//! Every message is stored as a [`DagNode`] that links to the previous head
//! of its conversation. A node's CID is the hash of its canonical JSON, so
//! the chain cannot be rewritten without changing every later CID.
//! [`ConversationManifest`] is a signed pointer to the latest node, published
//! so peers can discover heads they missed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use cairn_shared::constants::DAG_NODE_VERSION;
use cairn_shared::crypto::{decode_hex_32, sha256};
use cairn_shared::error::CryptoError;
use cairn_shared::protocol::MessageType;
use cairn_shared::types::{canonical_json_bytes, Cid, ConversationId, MessageId, WalletAddress};

use crate::conversations::{Conversation, ConversationSettings, ConversationType};
use crate::error::Result;
use crate::keystore::KeyStore;

pub const ALGORITHM_PAIRWISE: &str = "x25519-xchacha20poly1305";
pub const ALGORITHM_GROUP: &str = "xchacha20poly1305-wrapped";

/// A content key sealed for one group member.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WrappedKey {
    pub wallet: WalletAddress,
    pub key: String,
    pub nonce: String,
}

/// The signed, encrypted message as it travels inside a DAG node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub conversation_type: ConversationType,
    pub sender: WalletAddress,
    pub recipients: Vec<WalletAddress>,
    /// Hex ciphertext
    pub encrypted_content: String,
    /// Hex 24-byte nonce
    pub nonce: String,
    pub encryption_algorithm: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wrapped_keys: Vec<WrappedKey>,
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<MessageId>,
    /// Original message of an edit or delete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
    /// Hex Ed25519 signature over the raw SHA-256 of the plaintext
    pub signature: String,
    /// Hex SHA-256 of the plaintext
    pub message_hash: String,
}

impl MessageEnvelope {
    /// Check the sender's signature over `message_hash`. This says nothing
    /// about the ciphertext; see [`verify_plaintext`](Self::verify_plaintext).
    pub fn verify_signature(&self, signing_key_hex: &str) -> std::result::Result<(), CryptoError> {
        let hash = decode_hex_32(&self.message_hash)?;
        if KeyStore::verify(&hash, &self.signature, signing_key_hex) {
            Ok(())
        } else {
            Err(CryptoError::InvalidSignature)
        }
    }

    pub fn verify_plaintext(&self, plaintext: &[u8]) -> bool {
        hex::encode(sha256(plaintext)) == self.message_hash
    }

    pub fn wrapped_key_for(&self, wallet: &WalletAddress) -> Option<&WrappedKey> {
        self.wrapped_keys.iter().find(|k| &k.wallet == wallet)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DagNode {
    pub message: MessageEnvelope,
    pub previous: Option<Cid>,
    /// Distance from the genesis node
    pub depth: u64,
    /// Hex SHA-256 over the canonical `{message, previous, depth}`
    pub hash: String,
    /// Sender's signature over `hash`
    pub signature: String,
    pub version: u32,
}

impl DagNode {
    /// Link `message` after `previous` and sign the link.
    pub fn build(
        message: MessageEnvelope,
        previous: Option<Cid>,
        depth: u64,
        keystore: &KeyStore,
    ) -> Result<Self> {
        let digest = link_digest(&message, previous.as_ref(), depth)?;
        let signature = keystore.sign(&digest)?;
        Ok(Self {
            message,
            previous,
            depth,
            hash: hex::encode(digest),
            signature,
            version: DAG_NODE_VERSION,
        })
    }

    /// Recompute the link hash and check both signatures against the
    /// sender's Ed25519 key.
    pub fn verify(&self, signing_key_hex: &str) -> std::result::Result<(), CryptoError> {
        if self.previous.is_none() != (self.depth == 0) {
            return Err(CryptoError::InvalidSignature);
        }
        let digest = link_digest(&self.message, self.previous.as_ref(), self.depth)
            .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
        if hex::encode(digest) != self.hash {
            return Err(CryptoError::InvalidSignature);
        }
        if !KeyStore::verify(&digest, &self.signature, signing_key_hex) {
            return Err(CryptoError::InvalidSignature);
        }
        self.message.verify_signature(signing_key_hex)
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

fn link_digest(
    message: &MessageEnvelope,
    previous: Option<&Cid>,
    depth: u64,
) -> std::result::Result<[u8; 32], serde_json::Error> {
    let value = json!({
        "message": serde_json::to_value(message)?,
        "previous": previous,
        "depth": depth,
    });
    Ok(sha256(&canonical_json_bytes(&value)))
}

/// Signed snapshot of a conversation's chain, announced under
/// `manifest:<conversation>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationManifest {
    pub conversation_id: ConversationId,
    pub conversation_type: ConversationType,
    /// X25519 keys of the resolved participants
    pub participants: Vec<String>,
    pub genesis_message_cid: Option<Cid>,
    pub latest_message_cid: Cid,
    pub message_count: u64,
    pub depth: u64,
    pub settings: ConversationSettings,
    pub updated_at: DateTime<Utc>,
    pub signer: WalletAddress,
    #[serde(default)]
    pub signature: String,
}

impl ConversationManifest {
    /// Snapshot `conversation` as it is after a head change. `None` while the
    /// conversation has no head.
    pub fn snapshot(conversation: &Conversation, signer: WalletAddress) -> Option<Self> {
        let latest = conversation.head_cid.clone()?;
        Some(Self {
            conversation_id: conversation.id.clone(),
            conversation_type: conversation.conversation_type,
            participants: conversation
                .participants
                .iter()
                .filter(|p| !p.public_key.is_empty())
                .map(|p| p.public_key.clone())
                .collect(),
            genesis_message_cid: conversation.genesis_cid.clone(),
            latest_message_cid: latest,
            message_count: conversation.message_count,
            depth: conversation.head_depth,
            settings: conversation.settings.clone(),
            updated_at: Utc::now(),
            signer,
            signature: String::new(),
        })
    }

    pub fn sign(mut self, keystore: &KeyStore) -> Result<Self> {
        let digest = self.digest()?;
        self.signature = keystore.sign(&digest)?;
        Ok(self)
    }

    pub fn verify(&self, signing_key_hex: &str) -> bool {
        match self.digest() {
            Ok(digest) => KeyStore::verify(&digest, &self.signature, signing_key_hex),
            Err(_) => false,
        }
    }

    fn digest(&self) -> Result<[u8; 32]> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.remove("signature");
        }
        Ok(sha256(&canonical_json_bytes(&value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_store::MemoryRecordStore;
    use std::sync::Arc;

    fn wallet(c: char) -> WalletAddress {
        WalletAddress::parse(&format!("0x{}", c.to_string().repeat(40))).unwrap()
    }

    fn keystore(dir: &tempfile::TempDir, w: char) -> KeyStore {
        let ks = KeyStore::new(Arc::new(MemoryRecordStore::new()), dir.path().join("k"), "pw");
        ks.generate_identity(wallet(w), None).unwrap();
        ks
    }

    fn envelope(ks: &KeyStore, text: &str) -> MessageEnvelope {
        let hash = sha256(text.as_bytes());
        MessageEnvelope {
            id: MessageId::new(),
            conversation_id: ConversationId::direct(&wallet('a'), &wallet('b')),
            conversation_type: ConversationType::Direct,
            sender: wallet('a'),
            recipients: vec![wallet('b')],
            encrypted_content: "00".into(),
            nonce: "00".repeat(24),
            encryption_algorithm: ALGORITHM_PAIRWISE.into(),
            wrapped_keys: Vec::new(),
            message_type: MessageType::Text,
            reply_to: None,
            thread_id: None,
            references: None,
            expires_at: None,
            timestamp: Utc::now(),
            signature: ks.sign(&hash).unwrap(),
            message_hash: hex::encode(hash),
        }
    }

    #[test]
    fn test_node_verifies_and_survives_json() {
        let dir = tempfile::tempdir().unwrap();
        let ks = keystore(&dir, 'a');
        let key = ks.identity().unwrap().signing_key;

        let node = DagNode::build(envelope(&ks, "hi"), None, 0, &ks).unwrap();
        node.verify(&key).unwrap();

        let value = node.to_value().unwrap();
        let cid = Cid::for_json(&value);
        let back = DagNode::from_value(value).unwrap();
        back.verify(&key).unwrap();
        assert_eq!(Cid::for_json(&back.to_value().unwrap()), cid);
    }

    #[test]
    fn test_tampered_link_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ks = keystore(&dir, 'a');
        let key = ks.identity().unwrap().signing_key;

        let genesis = DagNode::build(envelope(&ks, "one"), None, 0, &ks).unwrap();
        let genesis_cid = Cid::for_json(&genesis.to_value().unwrap());
        let mut next = DagNode::build(envelope(&ks, "two"), Some(genesis_cid), 1, &ks).unwrap();
        next.verify(&key).unwrap();

        next.depth = 7;
        assert!(next.verify(&key).is_err());

        let other = keystore(&tempfile::tempdir().unwrap(), 'c');
        let node = DagNode::build(envelope(&ks, "x"), None, 0, &ks).unwrap();
        assert!(node.verify(&other.identity().unwrap().signing_key).is_err());
    }

    #[test]
    fn test_ciphertext_flip_keeps_signature_valid() {
        let dir = tempfile::tempdir().unwrap();
        let ks = keystore(&dir, 'a');
        let key = ks.identity().unwrap().signing_key;

        let mut env = envelope(&ks, "hello");
        env.encrypted_content = "ff".into();
        env.verify_signature(&key).unwrap();
        assert!(env.verify_plaintext(b"hello"));
        assert!(!env.verify_plaintext(b"hellO"));
    }

    #[test]
    fn test_manifest_signature() {
        let dir = tempfile::tempdir().unwrap();
        let ks = keystore(&dir, 'a');
        let key = ks.identity().unwrap().signing_key;

        let manifest = ConversationManifest {
            conversation_id: ConversationId::random(),
            conversation_type: ConversationType::Group,
            participants: vec!["aa".into()],
            genesis_message_cid: None,
            latest_message_cid: Cid::for_bytes(b"head"),
            message_count: 3,
            depth: 2,
            settings: ConversationSettings::default(),
            updated_at: Utc::now(),
            signer: wallet('a'),
            signature: String::new(),
        }
        .sign(&ks)
        .unwrap();
        assert!(manifest.verify(&key));

        let mut forged = manifest.clone();
        forged.depth = 9;
        assert!(!forged.verify(&key));
    }
}
