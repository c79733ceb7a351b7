/// Protocol version string for libp2p identify
pub const PROTOCOL_VERSION: &str = "/cairn/1.0.0";

/// Application name
pub const APP_NAME: &str = "Cairn";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// X25519 / Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Maximum gossip message size in bytes (256 KiB)
pub const MAX_MESSAGE_SIZE: usize = 262_144;

/// GossipSub heartbeat interval in seconds
pub const GOSSIPSUB_HEARTBEAT_SECS: u64 = 1;

/// Default QUIC listen port
pub const DEFAULT_QUIC_PORT: u16 = 4001;

/// Version stamped into every DAG node
pub const DAG_NODE_VERSION: u32 = 1;

/// Offline queue entry lifetime (7 days)
pub const OFFLINE_TTL_SECS: i64 = 7 * 24 * 60 * 60;

/// Presence entries older than this are treated as offline
pub const PRESENCE_THRESHOLD_SECS: i64 = 60;

/// Typing indicators expire after this much inactivity
pub const TYPING_EXPIRY_SECS: i64 = 5;

/// Maximum DAG nodes walked per conversation per sync pass
pub const MAX_SYNC_WALK: usize = 100;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_MESSAGE_KEY: &str = "cairn-message-key-v1";
pub const KDF_CONTEXT_KEY_FILE: &str = "cairn-key-file-v1";
pub const KDF_CONTEXT_LIBP2P_KEY: &str = "cairn-libp2p-keypair-v1";

/// Text signed by a wallet to bind it to an Ed25519 identity key
pub const WALLET_BINDING_PREFIX: &str = "cairn identity binding: ";

/// Topic prefixes
pub const TOPIC_CONVERSATION_PREFIX: &str = "cairn/conv/";
pub const TOPIC_INBOX_PREFIX: &str = "cairn/inbox/";
pub const TOPIC_SIGNAL_PREFIX: &str = "cairn/signal/";
pub const TOPIC_PRESENCE: &str = "cairn/presence";

/// Directory key prefixes
pub const DIR_PEER_PREFIX: &str = "peer:";
pub const DIR_OFFLINE_PREFIX: &str = "offline:";
pub const DIR_MANIFEST_PREFIX: &str = "manifest:";
