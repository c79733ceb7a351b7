//! Online status and typing indicators.
//!
//! Both are fire-and-forget: nothing here is persisted, publish failures are
//! logged, and the cache heals on the next heartbeat.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use cairn_shared::capability::PubSubTransport;
use cairn_shared::constants::TOPIC_PRESENCE;
use cairn_shared::identity::PresenceStatus;
use cairn_shared::protocol::{PresenceNotice, TypingNotice, WireMessage};
use cairn_shared::types::{ConversationId, WalletAddress};

use crate::error::Result;
use crate::events::{EngineEvent, EventBus};
use crate::keystore::KeyStore;

#[derive(Debug, Clone, Copy)]
struct Seen {
    status: PresenceStatus,
    at: DateTime<Utc>,
}

pub struct PresenceBus {
    keystore: Arc<KeyStore>,
    pubsub: Arc<dyn PubSubTransport>,
    events: EventBus,
    threshold: Duration,
    typing_expiry: Duration,
    publish_timeout: std::time::Duration,
    seen: RwLock<HashMap<WalletAddress, Seen>>,
    typing: RwLock<HashMap<ConversationId, HashMap<WalletAddress, DateTime<Utc>>>>,
}

impl PresenceBus {
    pub fn new(
        keystore: Arc<KeyStore>,
        pubsub: Arc<dyn PubSubTransport>,
        events: EventBus,
        threshold: Duration,
        typing_expiry: Duration,
        publish_timeout: std::time::Duration,
    ) -> Self {
        Self {
            keystore,
            pubsub,
            events,
            threshold,
            typing_expiry,
            publish_timeout,
            seen: RwLock::new(HashMap::new()),
            typing: RwLock::new(HashMap::new()),
        }
    }

    /// Record our own status and announce it on the presence topic.
    pub async fn broadcast(&self, status: PresenceStatus) -> Result<()> {
        let identity = self.keystore.set_status(status)?;
        let notice = WireMessage::Presence(PresenceNotice {
            wallet: identity.wallet_address,
            status,
            timestamp: identity.last_seen,
        });
        self.fire(TOPIC_PRESENCE, &notice).await;
        Ok(())
    }

    pub fn handle_presence(&self, notice: &PresenceNotice) {
        if self.is_local(&notice.wallet) {
            return;
        }
        if let Ok(mut seen) = self.seen.write() {
            seen.insert(
                notice.wallet.clone(),
                Seen {
                    status: notice.status,
                    at: Utc::now(),
                },
            );
        }
        self.events.publish(EngineEvent::Presence {
            wallet: notice.wallet.clone(),
            status: notice.status,
        });
    }

    /// True when `wallet` sent a non-offline heartbeat within the threshold.
    pub fn check_online(&self, wallet: &WalletAddress) -> bool {
        self.check_online_at(wallet, Utc::now())
    }

    pub fn check_online_at(&self, wallet: &WalletAddress, now: DateTime<Utc>) -> bool {
        self.status_at(wallet, now) != PresenceStatus::Offline
    }

    /// Last known status, `Offline` once it is stale.
    pub fn status_of(&self, wallet: &WalletAddress) -> PresenceStatus {
        self.status_at(wallet, Utc::now())
    }

    fn status_at(&self, wallet: &WalletAddress, now: DateTime<Utc>) -> PresenceStatus {
        let seen = self.seen.read().ok().and_then(|s| s.get(wallet).copied());
        match seen {
            Some(s) if now - s.at <= self.threshold => s.status,
            _ => PresenceStatus::Offline,
        }
    }

    pub async fn set_typing(&self, conversation: &ConversationId, typing: bool) -> Result<()> {
        let wallet = self.keystore.wallet()?;
        let notice = WireMessage::Typing(TypingNotice {
            conversation_id: conversation.clone(),
            wallet,
            typing,
            timestamp: Utc::now(),
        });
        self.fire(&conversation.to_topic(), &notice).await;
        Ok(())
    }

    pub fn handle_typing(&self, notice: &TypingNotice) {
        if self.is_local(&notice.wallet) {
            return;
        }
        if let Ok(mut typing) = self.typing.write() {
            let entry = typing.entry(notice.conversation_id.clone()).or_default();
            if notice.typing {
                entry.insert(notice.wallet.clone(), Utc::now());
            } else {
                entry.remove(&notice.wallet);
            }
        }
        self.events.publish(EngineEvent::Typing {
            conversation_id: notice.conversation_id.clone(),
            wallet: notice.wallet.clone(),
            typing: notice.typing,
        });
    }

    /// Wallets currently typing in `conversation`.
    pub fn typing_in(&self, conversation: &ConversationId) -> Vec<WalletAddress> {
        self.typing_in_at(conversation, Utc::now())
    }

    pub fn typing_in_at(&self, conversation: &ConversationId, now: DateTime<Utc>) -> Vec<WalletAddress> {
        let Ok(mut typing) = self.typing.write() else {
            return Vec::new();
        };
        let Some(entry) = typing.get_mut(conversation) else {
            return Vec::new();
        };
        entry.retain(|_, at| now - *at < self.typing_expiry);
        let mut wallets: Vec<WalletAddress> = entry.keys().cloned().collect();
        wallets.sort();
        wallets
    }

    fn is_local(&self, wallet: &WalletAddress) -> bool {
        self.keystore.wallet().is_ok_and(|w| &w == wallet)
    }

    async fn fire(&self, topic: &str, message: &WireMessage) {
        let bytes = match message.to_bytes() {
            Ok(b) => b,
            Err(e) => {
                debug!(error = %e, "presence encode failed");
                return;
            }
        };
        let publish = self.pubsub.publish(topic, bytes);
        match tokio::time::timeout(self.publish_timeout, publish).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(topic, error = %e, "presence publish dropped"),
            Err(_) => debug!(topic, "presence publish timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryHub;
    use cairn_store::MemoryRecordStore;

    fn wallet(c: char) -> WalletAddress {
        WalletAddress::parse(&format!("0x{}", c.to_string().repeat(40))).unwrap()
    }

    fn bus(dir: &tempfile::TempDir) -> (PresenceBus, EventBus) {
        let (pubsub, _rx) = MemoryHub::new().connect("a");
        bus_over(dir, pubsub, std::time::Duration::from_secs(1))
    }

    fn bus_over(
        dir: &tempfile::TempDir,
        pubsub: Arc<dyn PubSubTransport>,
        publish_timeout: std::time::Duration,
    ) -> (PresenceBus, EventBus) {
        let ks = Arc::new(KeyStore::new(
            Arc::new(MemoryRecordStore::new()),
            dir.path().join("k"),
            "pw",
        ));
        ks.generate_identity(wallet('a'), None).unwrap();
        let events = EventBus::new(16);
        let bus = PresenceBus::new(
            ks,
            pubsub,
            events.clone(),
            Duration::seconds(60),
            Duration::seconds(5),
            publish_timeout,
        );
        (bus, events)
    }

    fn presence(w: char, status: PresenceStatus) -> PresenceNotice {
        PresenceNotice {
            wallet: wallet(w),
            status,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_presence_goes_stale() {
        let dir = tempfile::tempdir().unwrap();
        let (bus, _) = bus(&dir);
        assert!(!bus.check_online(&wallet('b')));

        bus.handle_presence(&presence('b', PresenceStatus::Away));
        assert!(bus.check_online(&wallet('b')));
        assert_eq!(bus.status_of(&wallet('b')), PresenceStatus::Away);
        let later = Utc::now() + Duration::seconds(61);
        assert!(!bus.check_online_at(&wallet('b'), later));

        bus.handle_presence(&presence('b', PresenceStatus::Offline));
        assert!(!bus.check_online(&wallet('b')));
    }

    #[test]
    fn test_own_presence_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (bus, events) = bus(&dir);
        let mut rx = events.subscribe();
        bus.handle_presence(&presence('a', PresenceStatus::Online));
        assert!(!bus.check_online(&wallet('a')));
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_typing_expires_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let (bus, _) = bus(&dir);
        let conv = ConversationId::random();
        let notice = |typing| TypingNotice {
            conversation_id: conv.clone(),
            wallet: wallet('b'),
            typing,
            timestamp: Utc::now(),
        };

        bus.handle_typing(&notice(true));
        assert_eq!(bus.typing_in(&conv), vec![wallet('b')]);
        assert!(bus
            .typing_in_at(&conv, Utc::now() + Duration::seconds(6))
            .is_empty());

        bus.handle_typing(&notice(true));
        bus.handle_typing(&notice(false));
        assert!(bus.typing_in(&conv).is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_updates_identity() {
        let dir = tempfile::tempdir().unwrap();
        let (bus, _) = bus(&dir);
        bus.broadcast(PresenceStatus::Busy).await.unwrap();
        assert_eq!(bus.keystore.identity().unwrap().status, PresenceStatus::Busy);
    }

    #[tokio::test]
    async fn test_stalled_transport_does_not_block_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let (pubsub, _rx) = MemoryHub::new().connect("a");
        pubsub.set_stalled(true);
        let (bus, _) = bus_over(&dir, pubsub, std::time::Duration::from_millis(50));
        let done = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            bus.broadcast(PresenceStatus::Online),
        )
        .await;
        assert!(matches!(done, Ok(Ok(()))));
        assert_eq!(bus.keystore.identity().unwrap().status, PresenceStatus::Online);
    }
}
