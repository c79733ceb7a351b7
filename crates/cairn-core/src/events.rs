//! Typed engine event bus.
//!
//! Every component publishes onto one `broadcast` channel. Subscribers take
//! either everything or a single [`EventKind`].

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use cairn_media::{CallState, ConnectionState};
use cairn_shared::identity::PresenceStatus;
use cairn_shared::protocol::CallType;
use cairn_shared::types::{CallId, Cid, ConversationId, MessageId, WalletAddress};

use crate::messages::DeliveryStatus;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EngineEvent {
    MessageSent {
        conversation_id: ConversationId,
        message_id: MessageId,
        cid: Option<Cid>,
    },
    MessageReceived {
        conversation_id: ConversationId,
        message_id: MessageId,
        sender: WalletAddress,
        cid: Cid,
    },
    MessageStatus {
        conversation_id: ConversationId,
        message_id: MessageId,
        status: DeliveryStatus,
    },
    MessageFailed {
        conversation_id: ConversationId,
        message_id: MessageId,
        reason: String,
    },
    ConversationCreated {
        conversation_id: ConversationId,
    },
    ConversationUpdated {
        conversation_id: ConversationId,
    },
    SyncStarted {
        conversation_id: ConversationId,
    },
    SyncCompleted {
        conversation_id: ConversationId,
        pulled: usize,
    },
    SyncFailed {
        conversation_id: ConversationId,
        error: String,
    },
    Presence {
        wallet: WalletAddress,
        status: PresenceStatus,
    },
    Typing {
        conversation_id: ConversationId,
        wallet: WalletAddress,
        typing: bool,
    },
    Peer {
        wallet: WalletAddress,
        state: ConnectionState,
    },
    IncomingCall {
        call_id: CallId,
        from: WalletAddress,
        call_type: CallType,
    },
    Call {
        call_id: CallId,
        state: CallState,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message,
    Conversation,
    Sync,
    Presence,
    Typing,
    Peer,
    Call,
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::MessageSent { .. }
            | EngineEvent::MessageReceived { .. }
            | EngineEvent::MessageStatus { .. }
            | EngineEvent::MessageFailed { .. } => EventKind::Message,
            EngineEvent::ConversationCreated { .. } | EngineEvent::ConversationUpdated { .. } => {
                EventKind::Conversation
            }
            EngineEvent::SyncStarted { .. }
            | EngineEvent::SyncCompleted { .. }
            | EngineEvent::SyncFailed { .. } => EventKind::Sync,
            EngineEvent::Presence { .. } => EventKind::Presence,
            EngineEvent::Typing { .. } => EventKind::Typing,
            EngineEvent::Peer { .. } => EventKind::Peer,
            EngineEvent::IncomingCall { .. } | EngineEvent::Call { .. } => EventKind::Call,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Events nobody listens to are dropped.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
            kind: None,
        }
    }

    pub fn subscribe_kind(&self, kind: EventKind) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
            kind: Some(kind),
        }
    }
}

pub struct EventStream {
    rx: broadcast::Receiver<EngineEvent>,
    kind: Option<EventKind>,
}

impl EventStream {
    /// Next matching event; `None` once the bus is gone. A slow subscriber
    /// skips what it missed.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    fn matches(&self, event: &EngineEvent) -> bool {
        self.kind.map_or(true, |k| event.kind() == k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv() -> ConversationId {
        ConversationId("c1".into())
    }

    #[tokio::test]
    async fn test_kind_filter() {
        let bus = EventBus::new(16);
        let mut all = bus.subscribe();
        let mut sync_only = bus.subscribe_kind(EventKind::Sync);

        bus.publish(EngineEvent::ConversationCreated {
            conversation_id: conv(),
        });
        bus.publish(EngineEvent::SyncStarted {
            conversation_id: conv(),
        });

        assert_eq!(all.recv().await.map(|e| e.kind()), Some(EventKind::Conversation));
        assert_eq!(all.recv().await.map(|e| e.kind()), Some(EventKind::Sync));
        assert_eq!(sync_only.recv().await.map(|e| e.kind()), Some(EventKind::Sync));
        assert!(sync_only.try_recv().is_none());
    }

    #[test]
    fn test_event_serializes_tagged() {
        let json = serde_json::to_value(EngineEvent::SyncCompleted {
            conversation_id: conv(),
            pulled: 3,
        })
        .unwrap();
        assert_eq!(json["type"], "sync-completed");
        assert_eq!(json["pulled"], 3);
    }
}
