use thiserror::Error;

use cairn_media::{CallError, PeerConnectionError};
use cairn_shared::error::{
    ContentError, CryptoError, DirectoryError, IdentityError, ProtocolError, TransportError,
    WalletError,
};
use cairn_shared::types::{ConversationId, MessageId, WalletAddress};
use cairn_store::StoreError;

#[derive(Error, Debug)]
pub enum ConversationError {
    #[error("Conversation not found: {0}")]
    NotFound(ConversationId),

    #[error("No public key known for {0}")]
    RecipientKeyUnknown(WalletAddress),

    #[error("Invalid participants: {0}")]
    InvalidParticipants(String),

    #[error("No message {0} of yours in this conversation")]
    MessageNotFound(MessageId),
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("A sync is already in progress")]
    AlreadySyncing,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Conversation(#[from] ConversationError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Local store error: {0}")]
    Store(#[from] StoreError),

    #[error("Pin failed: {0}")]
    Pin(#[from] ContentError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Peer(#[from] PeerConnectionError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn not_found(id: &ConversationId) -> Self {
        ConversationError::NotFound(id.clone()).into()
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
