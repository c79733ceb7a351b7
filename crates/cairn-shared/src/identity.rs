use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::decode_hex_32;
use crate::error::{CryptoError, IdentityError};
use crate::types::WalletAddress;

/// Secret half of a local identity: an Ed25519 signing key and an X25519
/// encryption key. Never leaves the process except inside the encrypted
/// key file.
#[derive(Clone)]
pub struct IdentityKeys {
    signing_key: SigningKey,
    encryption_key: StaticSecret,
}

/// Serializable format for the key file
#[derive(Serialize, Deserialize)]
pub struct KeyBundle {
    pub wallet: String,
    pub signing_secret: [u8; 32],
    pub encryption_secret: [u8; 32],
}

impl IdentityKeys {
    /// Generate a new random key pair set
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
            encryption_key: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn from_bundle(bundle: &KeyBundle) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&bundle.signing_secret),
            encryption_key: StaticSecret::from(bundle.encryption_secret),
        }
    }

    pub fn to_bundle(&self, wallet: &WalletAddress) -> KeyBundle {
        KeyBundle {
            wallet: wallet.to_string(),
            signing_secret: *self.signing_key.as_bytes(),
            encryption_secret: self.encryption_key.to_bytes(),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn signing_public_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    pub fn encryption_public(&self) -> PublicKey {
        PublicKey::from(&self.encryption_key)
    }

    pub fn encryption_public_hex(&self) -> String {
        hex::encode(self.encryption_public().as_bytes())
    }

    pub fn encryption_secret(&self) -> &StaticSecret {
        &self.encryption_key
    }

    /// Sign raw bytes (callers pass a SHA-256 digest)
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn sign_hex(&self, message: &[u8]) -> String {
        hex::encode(self.sign(message).to_bytes())
    }
}

/// Verify a signature against a public key
pub fn verify_signature(
    pubkey_bytes: &[u8; 32],
    message: &[u8],
    signature: &Signature,
) -> Result<(), IdentityError> {
    let verifying_key =
        VerifyingKey::from_bytes(pubkey_bytes).map_err(|_| IdentityError::InvalidKeyBytes)?;
    verifying_key
        .verify(message, signature)
        .map_err(|_| IdentityError::InvalidKeyBytes)
}

/// Hex-encoded variant used for records that travel as JSON.
pub fn verify_signature_hex(
    pubkey_hex: &str,
    message: &[u8],
    signature_hex: &str,
) -> Result<(), CryptoError> {
    let pubkey = decode_hex_32(pubkey_hex)?;
    let sig_bytes =
        hex::decode(signature_hex).map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
    let signature = Signature::from_slice(&sig_bytes).map_err(|_| CryptoError::InvalidSignature)?;
    verify_signature(&pubkey, message, &signature).map_err(|_| CryptoError::InvalidSignature)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    #[default]
    Offline,
}

/// The single local identity of an installation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Hex Ed25519 verifying key
    pub id: String,
    pub wallet_address: WalletAddress,
    pub did: String,
    /// Hex X25519 public key
    pub public_key: String,
    /// Hex Ed25519 verifying key
    pub signing_key: String,
    pub display_name: Option<String>,
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
    /// Set once the wallet has signed a binding to `signing_key`.
    pub verified: bool,
    pub created_at: DateTime<Utc>,
}

impl Identity {
    pub fn new(wallet: WalletAddress, keys: &IdentityKeys, display_name: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: keys.signing_public_hex(),
            did: wallet.did(),
            wallet_address: wallet,
            public_key: keys.encryption_public_hex(),
            signing_key: keys.signing_public_hex(),
            display_name,
            status: PresenceStatus::Online,
            last_seen: now,
            verified: false,
            created_at: now,
        }
    }

    pub fn peer_record(&self) -> PeerRecord {
        PeerRecord {
            wallet: self.wallet_address.clone(),
            public_key: self.public_key.clone(),
            signing_key: self.signing_key.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

/// What the directory publishes for a wallet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub wallet: WalletAddress,
    pub public_key: String,
    pub signing_key: String,
    pub display_name: Option<String>,
}
