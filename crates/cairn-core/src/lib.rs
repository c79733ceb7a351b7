//! Serverless wallet-addressed messaging engine.
//!
//! Every component talks to the outside world through the capability traits
//! of [`cairn_shared::capability`] plus a local [`RecordStore`]. The
//! [`Messenger`] facade owns the components and routes inbound traffic.

pub mod config;
pub mod conversations;
pub mod dag;
pub mod error;
pub mod events;
pub mod keystore;
pub mod logging;
pub mod memory;
pub mod messages;
pub mod messenger;
pub mod offline;
pub mod p2p;
pub mod presence;
pub mod sync;

use std::sync::Arc;

use cairn_shared::capability::{ContentStore, DirectoryLookup, PubSubTransport};
use cairn_store::RecordStore;

pub use config::EngineConfig;
pub use conversations::{Conversation, ConversationSettings, ConversationType};
pub use error::{EngineError, Result};
pub use events::{EngineEvent, EventBus, EventKind, EventStream};
pub use keystore::KeyStore;
pub use messages::{DecryptedMessage, DeliveryStatus, SendOptions, SendResult};
pub use messenger::Messenger;
pub use sync::SyncReport;

/// The outside world as the engine sees it.
#[derive(Clone)]
pub struct Capabilities {
    pub records: Arc<dyn RecordStore>,
    pub content: Arc<dyn ContentStore>,
    pub pubsub: Arc<dyn PubSubTransport>,
    pub directory: Arc<dyn DirectoryLookup>,
}
