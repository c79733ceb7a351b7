use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::constants::{KDF_CONTEXT_MESSAGE_KEY, NONCE_SIZE};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; 32];
pub type Nonce = [u8; NONCE_SIZE];

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

pub fn generate_nonce() -> Nonce {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

// Returns nonce || ciphertext (24 bytes nonce prepended)
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let (ciphertext, nonce_bytes) = encrypt_detached(key, plaintext)?;
    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(nonce_bytes);
    decrypt_detached(key, ciphertext, &nonce)
}

/// Encrypt with a fresh random nonce, returned alongside the ciphertext.
pub fn encrypt_detached(
    key: &SymmetricKey,
    plaintext: &[u8],
) -> Result<(Vec<u8>, Nonce), CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    Ok((ciphertext, nonce_bytes))
}

pub fn decrypt_detached(
    key: &SymmetricKey,
    ciphertext: &[u8],
    nonce: &Nonce,
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Pairwise message key: X25519 DH followed by a BLAKE3 KDF bound to both
/// public keys. Either side of the pair derives the same key.
pub fn derive_pair_key(local_secret: &StaticSecret, peer_public: &PublicKey) -> SymmetricKey {
    let shared = local_secret.diffie_hellman(peer_public);
    let local_public = PublicKey::from(local_secret);
    let (lo, hi) = if local_public.as_bytes() <= peer_public.as_bytes() {
        (local_public.to_bytes(), peer_public.to_bytes())
    } else {
        (peer_public.to_bytes(), local_public.to_bytes())
    };

    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_MESSAGE_KEY);
    hasher.update(shared.as_bytes());
    hasher.update(&lo);
    hasher.update(&hi);
    *hasher.finalize().as_bytes()
}

pub fn seal_for(
    local_secret: &StaticSecret,
    peer_public: &PublicKey,
    plaintext: &[u8],
) -> Result<(Vec<u8>, Nonce), CryptoError> {
    let key = derive_pair_key(local_secret, peer_public);
    encrypt_detached(&key, plaintext)
}

pub fn open_from(
    local_secret: &StaticSecret,
    peer_public: &PublicKey,
    ciphertext: &[u8],
    nonce: &Nonce,
) -> Result<Vec<u8>, CryptoError> {
    let key = derive_pair_key(local_secret, peer_public);
    decrypt_detached(&key, ciphertext, nonce)
}

pub fn parse_x25519_public(hex_str: &str) -> Result<PublicKey, CryptoError> {
    let bytes = decode_hex_32(hex_str)?;
    Ok(PublicKey::from(bytes))
}

pub fn parse_nonce(hex_str: &str) -> Result<Nonce, CryptoError> {
    let bytes = hex::decode(hex_str).map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
    if bytes.len() != NONCE_SIZE {
        return Err(CryptoError::InvalidKeyLength);
    }
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&bytes);
    Ok(nonce)
}

pub fn decode_hex_32(hex_str: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = hex::decode(hex_str).map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
    if bytes.len() != 32 {
        return Err(CryptoError::InvalidKeyLength);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

pub fn derive_key_from_passphrase(passphrase: &[u8], context: &str) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(passphrase);
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = generate_symmetric_key();
        let plaintext = b"hello over the dag";

        let encrypted = encrypt(&key, plaintext).unwrap();
        let decrypted = decrypt(&key, &encrypted).unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = generate_symmetric_key();
        let key2 = generate_symmetric_key();

        let encrypted = encrypt(&key1, b"Secret message").unwrap();
        assert!(decrypt(&key2, &encrypted).is_err());
    }

    #[test]
    fn test_empty_data_fails() {
        let key = generate_symmetric_key();
        assert!(decrypt(&key, &[]).is_err());
    }

    #[test]
    fn test_pair_key_symmetric() {
        let alice = StaticSecret::random_from_rng(OsRng);
        let bob = StaticSecret::random_from_rng(OsRng);

        let k1 = derive_pair_key(&alice, &PublicKey::from(&bob));
        let k2 = derive_pair_key(&bob, &PublicKey::from(&alice));
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_seal_open_both_directions() {
        let alice = StaticSecret::random_from_rng(OsRng);
        let bob = StaticSecret::random_from_rng(OsRng);
        let bob_pub = PublicKey::from(&bob);
        let alice_pub = PublicKey::from(&alice);

        let (ct, nonce) = seal_for(&alice, &bob_pub, b"hi bob").unwrap();
        assert_eq!(open_from(&bob, &alice_pub, &ct, &nonce).unwrap(), b"hi bob");
        // the sender can reopen its own message with the recipient's key
        assert_eq!(open_from(&alice, &bob_pub, &ct, &nonce).unwrap(), b"hi bob");
    }

    #[test]
    fn test_third_party_cannot_open() {
        let alice = StaticSecret::random_from_rng(OsRng);
        let bob = StaticSecret::random_from_rng(OsRng);
        let eve = StaticSecret::random_from_rng(OsRng);

        let (ct, nonce) = seal_for(&alice, &PublicKey::from(&bob), b"private").unwrap();
        assert!(open_from(&eve, &PublicKey::from(&alice), &ct, &nonce).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let alice = StaticSecret::random_from_rng(OsRng);
        let bob = StaticSecret::random_from_rng(OsRng);

        let (mut ct, nonce) = seal_for(&alice, &PublicKey::from(&bob), b"data").unwrap();
        ct[0] ^= 0xFF;
        assert!(open_from(&bob, &PublicKey::from(&alice), &ct, &nonce).is_err());
    }

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
