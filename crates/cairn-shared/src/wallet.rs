//! Wallet binding proofs.
//!
//! A wallet proves ownership of an Ed25519 identity key by `personal_sign`-ing
//! the text `"cairn identity binding: <hex key>"`. We recover the signer from
//! the 65-byte secp256k1 signature and compare it with the claimed address.

use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use sha3::{Digest, Keccak256};

use crate::constants::WALLET_BINDING_PREFIX;
use crate::error::WalletError;
use crate::types::WalletAddress;

pub fn binding_message(signing_key_hex: &str) -> String {
    format!("{WALLET_BINDING_PREFIX}{signing_key_hex}")
}

/// EIP-191 hash of a personal message.
pub fn eip191_hash(message: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(format!("\x19Ethereum Signed Message:\n{}", message.len()).as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

pub fn address_of(key: &VerifyingKey) -> WalletAddress {
    let point = key.to_encoded_point(false);
    // skip the 0x04 tag
    let digest = Keccak256::digest(&point.as_bytes()[1..]);
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&digest[12..]);
    WalletAddress::from_bytes(&addr)
}

/// Recover the wallet that produced `signature_hex` over `message`.
pub fn recover_signer(message: &[u8], signature_hex: &str) -> Result<WalletAddress, WalletError> {
    let raw = hex::decode(signature_hex.trim_start_matches("0x"))
        .map_err(|_| WalletError::InvalidSignature)?;
    if raw.len() != 65 {
        return Err(WalletError::InvalidSignature);
    }

    let signature = Signature::from_slice(&raw[..64]).map_err(|_| WalletError::InvalidSignature)?;
    let v = match raw[64] {
        27 | 28 => raw[64] - 27,
        v => v,
    };
    let recovery_id = RecoveryId::from_byte(v).ok_or(WalletError::InvalidSignature)?;

    let prehash = eip191_hash(message);
    let key = VerifyingKey::recover_from_prehash(&prehash, &signature, recovery_id)
        .map_err(|_| WalletError::InvalidSignature)?;
    Ok(address_of(&key))
}

/// Check that `wallet` signed the binding message for `signing_key_hex`.
pub fn verify_binding(
    wallet: &WalletAddress,
    signing_key_hex: &str,
    signature_hex: &str,
) -> Result<(), WalletError> {
    let message = binding_message(signing_key_hex);
    let recovered = recover_signer(message.as_bytes(), signature_hex)?;
    if &recovered != wallet {
        return Err(WalletError::AddressMismatch {
            expected: wallet.to_string(),
            recovered: recovered.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::SigningKey;
    use rand::rngs::OsRng;

    fn personal_sign(key: &SigningKey, message: &[u8]) -> String {
        let (sig, recid) = key
            .sign_prehash_recoverable(&eip191_hash(message))
            .unwrap();
        let mut raw = sig.to_bytes().to_vec();
        raw.push(recid.to_byte() + 27);
        format!("0x{}", hex::encode(raw))
    }

    #[test]
    fn test_recover_matches_address() {
        let key = SigningKey::random(&mut OsRng);
        let wallet = address_of(key.verifying_key());

        let sig = personal_sign(&key, b"hello");
        assert_eq!(recover_signer(b"hello", &sig).unwrap(), wallet);
    }

    #[test]
    fn test_binding_verifies() {
        let key = SigningKey::random(&mut OsRng);
        let wallet = address_of(key.verifying_key());
        let ed_key = "ab".repeat(32);

        let sig = personal_sign(&key, binding_message(&ed_key).as_bytes());
        assert!(verify_binding(&wallet, &ed_key, &sig).is_ok());
        // signature over a different identity key does not bind
        assert!(verify_binding(&wallet, &"cd".repeat(32), &sig).is_err());
    }

    #[test]
    fn test_binding_rejects_other_wallet() {
        let key = SigningKey::random(&mut OsRng);
        let other = WalletAddress::parse("0x2222222222222222222222222222222222222222").unwrap();
        let ed_key = "ab".repeat(32);

        let sig = personal_sign(&key, binding_message(&ed_key).as_bytes());
        assert!(matches!(
            verify_binding(&other, &ed_key, &sig),
            Err(WalletError::AddressMismatch { .. })
        ));
    }

    #[test]
    fn test_malformed_signature() {
        assert!(recover_signer(b"x", "0x1234").is_err());
        assert!(recover_signer(b"x", "not hex").is_err());
    }
}
