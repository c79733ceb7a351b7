use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("No local identity")]
    NoLocalIdentity,

    #[error("Key file error: {0}")]
    KeyFile(String),

    #[error("Secret keys missing or corrupt; the identity must be re-created")]
    KeysUnavailable,
}

#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Invalid wallet address: {0}")]
    InvalidAddress(String),

    #[error("Invalid wallet signature")]
    InvalidSignature,

    #[error("Wallet signature recovers {recovered}, expected {expected}")]
    AddressMismatch { expected: String, recovered: String },
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Publish failed on {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Subscribe failed on {topic}: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("Operation timed out")]
    Timeout,
}

#[derive(Error, Debug)]
pub enum ContentError {
    #[error("Content not found: {0}")]
    NotFound(String),

    #[error("Invalid CID: {0}")]
    InvalidCid(String),

    #[error("Content does not match CID {0}")]
    Mismatch(String),

    #[error("Content store failure: {0}")]
    Backend(String),

    #[error("Operation timed out")]
    Timeout,
}

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Directory unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed directory record for {key}: {reason}")]
    Malformed { key: String, reason: String },

    #[error("Operation timed out")]
    Timeout,
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Message too large: {size} bytes")]
    TooLarge { size: usize },
}
