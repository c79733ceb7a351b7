//! Local identity and its secret keys.
//!
//! The secret keys live in process memory and in a key file encrypted with
//! XChaCha20-Poly1305 under a key derived from the configured passphrase.
//! The public [`Identity`] record is kept in the record store.
//!
//! There is no key recovery. If the key file is lost the identity has to be
//! created again, and messages encrypted to the old key stay unreadable.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tracing::{debug, info};
use x25519_dalek::PublicKey;

use cairn_shared::constants::KDF_CONTEXT_KEY_FILE;
use cairn_shared::crypto::{self, Nonce, SymmetricKey};
use cairn_shared::error::{CryptoError, IdentityError};
use cairn_shared::identity::{verify_signature_hex, Identity, IdentityKeys, KeyBundle, PresenceStatus};
use cairn_shared::types::WalletAddress;
use cairn_shared::wallet;
use cairn_store::records::RecordStoreExt;
use cairn_store::RecordStore;

use crate::error::Result;

pub const IDENTITY_NAMESPACE: &str = "identity";
const IDENTITY_KEY: &str = "local";

struct Loaded {
    identity: Identity,
    keys: IdentityKeys,
}

pub struct KeyStore {
    records: Arc<dyn RecordStore>,
    key_file: PathBuf,
    file_key: SymmetricKey,
    loaded: RwLock<Option<Loaded>>,
}

impl KeyStore {
    pub fn new(records: Arc<dyn RecordStore>, key_file: impl Into<PathBuf>, passphrase: &str) -> Self {
        Self {
            records,
            key_file: key_file.into(),
            file_key: crypto::derive_key_from_passphrase(passphrase.as_bytes(), KDF_CONTEXT_KEY_FILE),
            loaded: RwLock::new(None),
        }
    }

    pub fn key_file(&self) -> &Path {
        &self.key_file
    }

    /// Create a fresh identity for `wallet`, replacing any existing one.
    pub fn generate_identity(
        &self,
        wallet: WalletAddress,
        display_name: Option<String>,
    ) -> Result<Identity> {
        let keys = IdentityKeys::generate();
        let identity = Identity::new(wallet, &keys, display_name);

        self.write_key_file(&keys, &identity.wallet_address)?;
        self.records
            .put_json(IDENTITY_NAMESPACE, IDENTITY_KEY, &identity)?;

        info!(wallet = %identity.wallet_address.short(), "identity created");
        self.set_loaded(identity.clone(), keys);
        Ok(identity)
    }

    /// Load the persisted identity and decrypt its keys. `Ok(None)` when no
    /// identity was ever created.
    pub fn load_identity(&self) -> Result<Option<Identity>> {
        let Some(identity) = self
            .records
            .get_json::<Identity>(IDENTITY_NAMESPACE, IDENTITY_KEY)?
        else {
            return Ok(None);
        };

        let bundle = self.read_key_file()?;
        if bundle.wallet != identity.wallet_address.as_str() {
            return Err(IdentityError::KeyFile("key file belongs to another wallet".into()).into());
        }
        let keys = IdentityKeys::from_bundle(&bundle);
        if keys.signing_public_hex() != identity.signing_key {
            return Err(IdentityError::KeyFile("key file does not match identity".into()).into());
        }

        debug!(wallet = %identity.wallet_address.short(), "identity loaded");
        self.set_loaded(identity.clone(), keys);
        Ok(Some(identity))
    }

    /// Load the identity for `wallet`, creating it if none exists.
    pub fn load_or_generate(
        &self,
        wallet: WalletAddress,
        display_name: Option<String>,
    ) -> Result<Identity> {
        match self.load_identity()? {
            Some(identity) if identity.wallet_address == wallet => Ok(identity),
            _ => self.generate_identity(wallet, display_name),
        }
    }

    pub fn identity(&self) -> Result<Identity> {
        self.read_loaded(|l| l.identity.clone())
    }

    pub fn wallet(&self) -> Result<WalletAddress> {
        self.read_loaded(|l| l.identity.wallet_address.clone())
    }

    /// Ed25519 signature (hex) over a 32-byte hash.
    pub fn sign(&self, hash: &[u8; 32]) -> Result<String> {
        self.read_loaded(|l| l.keys.sign_hex(hash))
    }

    pub fn verify(hash: &[u8; 32], signature_hex: &str, signing_key_hex: &str) -> bool {
        verify_signature_hex(signing_key_hex, hash, signature_hex).is_ok()
    }

    pub fn encrypt_for(&self, plaintext: &[u8], recipient_public_hex: &str) -> Result<(Vec<u8>, Nonce)> {
        let peer = crypto::parse_x25519_public(recipient_public_hex)?;
        self.with_keys(|keys| crypto::seal_for(keys.encryption_secret(), &peer, plaintext))?
            .map_err(Into::into)
    }

    /// Fails with `DecryptionFailed` on tampered ciphertext or the wrong key.
    pub fn decrypt_from(
        &self,
        ciphertext: &[u8],
        nonce: &Nonce,
        sender_public_hex: &str,
    ) -> std::result::Result<Vec<u8>, CryptoError> {
        let peer = crypto::parse_x25519_public(sender_public_hex)?;
        self.with_keys(|keys| crypto::open_from(keys.encryption_secret(), &peer, ciphertext, nonce))
            .map_err(|_| CryptoError::DecryptionFailed)?
    }

    /// Seed for the transport identity. Derived keys only; never put it on
    /// the wire.
    pub fn network_seed(&self) -> Result<[u8; 32]> {
        self.read_loaded(|l| l.keys.to_bundle(&l.identity.wallet_address).signing_secret)
    }

    pub fn encryption_public(&self) -> Result<PublicKey> {
        self.read_loaded(|l| l.keys.encryption_public())
    }

    /// Attach a wallet signature proving the wallet owns this identity.
    pub fn bind_wallet(&self, signature_hex: &str) -> Result<Identity> {
        let identity = self.identity()?;
        wallet::verify_binding(&identity.wallet_address, &identity.signing_key, signature_hex)?;
        self.update(|id| id.verified = true)
    }

    pub fn update_profile(&self, display_name: Option<String>) -> Result<Identity> {
        self.update(|id| id.display_name = display_name)
    }

    pub fn set_status(&self, status: PresenceStatus) -> Result<Identity> {
        self.update(|id| {
            id.status = status;
            id.last_seen = Utc::now();
        })
    }

    fn update(&self, f: impl FnOnce(&mut Identity)) -> Result<Identity> {
        let mut guard = self.loaded.write().unwrap_or_else(|e| e.into_inner());
        let loaded = guard.as_mut().ok_or(IdentityError::NoLocalIdentity)?;
        f(&mut loaded.identity);
        self.records
            .put_json(IDENTITY_NAMESPACE, IDENTITY_KEY, &loaded.identity)?;
        Ok(loaded.identity.clone())
    }

    fn with_keys<T>(&self, f: impl FnOnce(&IdentityKeys) -> T) -> Result<T> {
        self.read_loaded(|l| f(&l.keys))
    }

    fn read_loaded<T>(&self, f: impl FnOnce(&Loaded) -> T) -> Result<T> {
        let guard = self.loaded.read().unwrap_or_else(|e| e.into_inner());
        let loaded = guard.as_ref().ok_or(IdentityError::NoLocalIdentity)?;
        Ok(f(loaded))
    }

    fn set_loaded(&self, identity: Identity, keys: IdentityKeys) {
        *self.loaded.write().unwrap_or_else(|e| e.into_inner()) = Some(Loaded { identity, keys });
    }

    fn write_key_file(&self, keys: &IdentityKeys, wallet: &WalletAddress) -> Result<()> {
        let bundle = keys.to_bundle(wallet);
        let plain = bincode::serialize(&bundle)
            .map_err(|e| IdentityError::KeyFile(format!("encode: {e}")))?;
        let sealed = crypto::encrypt(&self.file_key, &plain)?;

        if let Some(parent) = self.key_file.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| IdentityError::KeyFile(format!("{}: {e}", parent.display())))?;
        }
        std::fs::write(&self.key_file, sealed)
            .map_err(|e| IdentityError::KeyFile(format!("{}: {e}", self.key_file.display())))?;
        Ok(())
    }

    fn read_key_file(&self) -> Result<KeyBundle> {
        let sealed = std::fs::read(&self.key_file).map_err(|_| IdentityError::KeysUnavailable)?;
        let plain = crypto::decrypt(&self.file_key, &sealed)
            .map_err(|_| IdentityError::KeyFile("wrong passphrase or corrupt key file".into()))?;
        let bundle = bincode::deserialize(&plain)
            .map_err(|e| IdentityError::KeyFile(format!("decode: {e}")))?;
        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_shared::crypto::sha256;
    use cairn_store::MemoryRecordStore;

    fn wallet(c: char) -> WalletAddress {
        WalletAddress::parse(&format!("0x{}", c.to_string().repeat(40))).unwrap()
    }

    fn keystore(dir: &Path, passphrase: &str) -> (KeyStore, Arc<MemoryRecordStore>) {
        let records = Arc::new(MemoryRecordStore::new());
        let ks = KeyStore::new(records.clone(), dir.join("identity.key"), passphrase);
        (ks, records)
    }

    #[test]
    fn test_generate_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let (ks, records) = keystore(dir.path(), "pw");
        let created = ks.generate_identity(wallet('a'), Some("Alice".into())).unwrap();
        assert_eq!(created.did, format!("did:pkh:eip155:1:{}", wallet('a')));
        assert!(!created.verified);

        let reopened = KeyStore::new(records, dir.path().join("identity.key"), "pw");
        let loaded = reopened.load_identity().unwrap().unwrap();
        assert_eq!(loaded, created);
        assert_eq!(
            reopened.encryption_public().unwrap().as_bytes(),
            ks.encryption_public().unwrap().as_bytes()
        );
    }

    #[test]
    fn test_wrong_passphrase_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (ks, records) = keystore(dir.path(), "right");
        ks.generate_identity(wallet('a'), None).unwrap();

        let other = KeyStore::new(records, dir.path().join("identity.key"), "wrong");
        assert!(other.load_identity().is_err());
    }

    #[test]
    fn test_missing_identity_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let (ks, _) = keystore(dir.path(), "pw");
        assert!(ks.load_identity().unwrap().is_none());
        assert!(matches!(
            ks.identity(),
            Err(crate::error::EngineError::Identity(IdentityError::NoLocalIdentity))
        ));
    }

    #[test]
    fn test_sign_verify_over_hash() {
        let dir = tempfile::tempdir().unwrap();
        let (ks, _) = keystore(dir.path(), "pw");
        let identity = ks.generate_identity(wallet('a'), None).unwrap();

        let hash = sha256(b"hello");
        let sig = ks.sign(&hash).unwrap();
        assert!(KeyStore::verify(&hash, &sig, &identity.signing_key));
        assert!(!KeyStore::verify(&sha256(b"other"), &sig, &identity.signing_key));
    }

    #[test]
    fn test_encrypt_for_decrypt_from() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let (a, _) = keystore(dir_a.path(), "a");
        let (b, _) = keystore(dir_b.path(), "b");
        let id_a = a.generate_identity(wallet('a'), None).unwrap();
        let id_b = b.generate_identity(wallet('b'), None).unwrap();

        let (ct, nonce) = a.encrypt_for(b"hello", &id_b.public_key).unwrap();
        assert_eq!(b.decrypt_from(&ct, &nonce, &id_a.public_key).unwrap(), b"hello");
        // the sender can read its own message too
        assert_eq!(a.decrypt_from(&ct, &nonce, &id_b.public_key).unwrap(), b"hello");

        let mut tampered = ct.clone();
        tampered[0] ^= 0xff;
        assert!(matches!(
            b.decrypt_from(&tampered, &nonce, &id_a.public_key),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_profile_and_status_persist() {
        let dir = tempfile::tempdir().unwrap();
        let (ks, records) = keystore(dir.path(), "pw");
        ks.generate_identity(wallet('a'), None).unwrap();
        ks.update_profile(Some("Ada".into())).unwrap();
        ks.set_status(PresenceStatus::Away).unwrap();

        let stored: Identity = records
            .get_json(IDENTITY_NAMESPACE, IDENTITY_KEY)
            .unwrap()
            .unwrap();
        assert_eq!(stored.display_name.as_deref(), Some("Ada"));
        assert_eq!(stored.status, PresenceStatus::Away);
    }

    #[test]
    fn test_bind_wallet() {
        use k256::ecdsa::SigningKey;

        let dir = tempfile::tempdir().unwrap();
        let (ks, _) = keystore(dir.path(), "pw");
        let secp = SigningKey::random(&mut rand::rngs::OsRng);
        let owner = wallet::address_of(secp.verifying_key());
        let identity = ks.generate_identity(owner, None).unwrap();

        let message = wallet::binding_message(&identity.signing_key);
        let prehash = wallet::eip191_hash(message.as_bytes());
        let (sig, recid) = secp.sign_prehash_recoverable(&prehash).unwrap();
        let mut raw = sig.to_bytes().to_vec();
        raw.push(recid.to_byte() + 27);

        let bound = ks.bind_wallet(&hex::encode(raw)).unwrap();
        assert!(bound.verified);
        assert!(ks.bind_wallet(&"00".repeat(65)).is_err());
    }
}
