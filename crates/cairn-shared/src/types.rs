use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::constants::{
    TOPIC_CONVERSATION_PREFIX, TOPIC_INBOX_PREFIX, TOPIC_SIGNAL_PREFIX,
};
use crate::error::{ContentError, WalletError};

// Wallet identity = lowercase 0x-prefixed 20-byte hex address
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct WalletAddress(String);

impl WalletAddress {
    pub fn parse(raw: &str) -> Result<Self, WalletError> {
        let s = raw.trim().to_ascii_lowercase();
        let hex_part = s
            .strip_prefix("0x")
            .ok_or_else(|| WalletError::InvalidAddress(raw.to_string()))?;
        if hex_part.len() != 40 || !hex_part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(WalletError::InvalidAddress(raw.to_string()));
        }
        Ok(Self(s))
    }

    pub fn from_bytes(bytes: &[u8; 20]) -> Self {
        Self(format!("0x{}", hex::encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> String {
        self.0[..10].to_string()
    }

    pub fn did(&self) -> String {
        format!("did:pkh:eip155:1:{}", self.0)
    }

    pub fn inbox_topic(&self) -> String {
        format!("{TOPIC_INBOX_PREFIX}{}", self.0)
    }

    pub fn signal_topic(&self) -> String {
        format!("{TOPIC_SIGNAL_PREFIX}{}", self.0)
    }
}

impl std::fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for WalletAddress {
    type Error = WalletError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<WalletAddress> for String {
    fn from(value: WalletAddress) -> Self {
        value.0
    }
}

impl std::str::FromStr for WalletAddress {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Both sides of a direct conversation derive the same id.
    pub fn direct(a: &WalletAddress, b: &WalletAddress) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let digest = Sha256::digest(format!("direct:{lo}:{hi}").as_bytes());
        Self(hex::encode(digest)[..32].to_string())
    }

    pub fn to_topic(&self) -> String {
        format!("{TOPIC_CONVERSATION_PREFIX}{}", self.0)
    }

    pub fn from_topic(topic: &str) -> Option<Self> {
        topic
            .strip_prefix(TOPIC_CONVERSATION_PREFIX)
            .filter(|s| !s.is_empty())
            .map(|s| Self(s.to_string()))
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct CallId(pub Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// CIDv1 prefix: multibase base16 ("f"), version 1, dag-json codec (0x0129
/// as varint a9 02), sha2-256 multihash (0x12, 32 bytes).
const CID_PREFIX: &str = "f01a9021220";

/// Content identifier of an immutable JSON blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Cid(String);

impl Cid {
    pub fn for_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(format!("{CID_PREFIX}{}", hex::encode(digest)))
    }

    /// CID of a JSON value, computed over its canonical encoding.
    pub fn for_json(value: &Value) -> Self {
        Self::for_bytes(&canonical_json_bytes(value))
    }

    pub fn parse(s: &str) -> Result<Self, ContentError> {
        let digest = s
            .strip_prefix(CID_PREFIX)
            .ok_or_else(|| ContentError::InvalidCid(s.to_string()))?;
        if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ContentError::InvalidCid(s.to_string()));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when `value` hashes to this CID.
    pub fn matches(&self, value: &Value) -> bool {
        Self::for_json(value) == *self
    }
}

impl std::fmt::Display for Cid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rebuild a JSON value with every object's keys in sorted order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                out.insert(k.clone(), canonicalize(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Deterministic byte encoding used for content addressing and signatures.
pub fn canonical_json_bytes(value: &Value) -> Vec<u8> {
    // Serializing a Value cannot fail: keys are strings and numbers are finite.
    serde_json::to_vec(&canonicalize(value)).unwrap_or_default()
}
