//! The engine facade.
//!
//! [`Messenger`] wires every component to one set of [`Capabilities`],
//! subscribes to the topics this wallet cares about and routes inbound
//! traffic. Components stay reachable through accessors for callers that
//! need more than the facade offers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cairn_media::{
    CallEvent, CallInfo, CallManager, CallState, IceServerRegistry, MediaKind,
    PeerConnectionManager, PeerEvent, RtcBackend, TransportEvent,
};
use cairn_shared::capability::InboundMessage;
use cairn_shared::constants::{DIR_PEER_PREFIX, TOPIC_PRESENCE};
use cairn_shared::error::TransportError;
use cairn_shared::identity::{Identity, PresenceStatus};
use cairn_shared::protocol::{CallType, WireMessage};
use cairn_shared::types::{CallId, ConversationId, MessageId, WalletAddress};

use crate::config::EngineConfig;
use crate::conversations::{Conversation, ConversationSettings, ConversationStore, ConversationType};
use crate::error::Result;
use crate::events::{EngineEvent, EventBus, EventKind, EventStream};
use crate::keystore::KeyStore;
use crate::messages::{
    ChatMessage, DecryptedMessage, MessageEngine, RetryReport, SendOptions, SendResult,
};
use crate::offline::OfflineMessageQueue;
use crate::presence::PresenceBus;
use crate::sync::{PullResult, SyncCoordinator, SyncReport};
use crate::Capabilities;

pub struct Messenger {
    wallet: WalletAddress,
    keystore: Arc<KeyStore>,
    caps: Capabilities,
    events: EventBus,
    conversations: Arc<ConversationStore>,
    presence: Arc<PresenceBus>,
    offline: Arc<OfflineMessageQueue>,
    messages: Arc<MessageEngine>,
    sync: Arc<SyncCoordinator>,
    peers: Arc<PeerConnectionManager>,
    calls: Arc<CallManager>,
    network_timeout: Duration,
    transport_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Messenger {
    /// Build every component. The keystore must already hold an identity.
    pub fn new(
        keystore: Arc<KeyStore>,
        caps: Capabilities,
        rtc: Arc<dyn RtcBackend>,
        config: EngineConfig,
    ) -> Result<Arc<Self>> {
        let wallet = keystore.wallet()?;
        let events = EventBus::new(config.event_capacity);

        let conversations = Arc::new(ConversationStore::new(
            keystore.clone(),
            caps.records.clone(),
            caps.directory.clone(),
            events.clone(),
            config.network_timeout,
        )?);
        let presence = Arc::new(PresenceBus::new(
            keystore.clone(),
            caps.pubsub.clone(),
            events.clone(),
            config.presence_threshold,
            config.typing_expiry,
            config.network_timeout,
        ));
        let offline = Arc::new(OfflineMessageQueue::new(
            keystore.clone(),
            caps.records.clone(),
            caps.directory.clone(),
            config.offline_ttl,
            config.network_timeout,
        ));
        let messages = Arc::new(MessageEngine::new(
            keystore.clone(),
            conversations.clone(),
            presence.clone(),
            offline.clone(),
            &caps,
            events.clone(),
            config.clone(),
        ));
        let sync = Arc::new(SyncCoordinator::new(
            conversations.clone(),
            messages.clone(),
            offline.clone(),
            presence.clone(),
            &caps,
            events.clone(),
            config.max_sync_walk,
            config.network_timeout,
        ));

        let (peers, transport_rx) = PeerConnectionManager::new(
            wallet.clone(),
            rtc,
            caps.pubsub.clone(),
            Arc::new(IceServerRegistry::new()),
        );
        let calls = CallManager::new(peers.clone(), caps.records.clone());

        info!(wallet = %wallet.short(), "messenger ready");
        Ok(Arc::new(Self {
            wallet,
            keystore,
            caps,
            events,
            conversations,
            presence,
            offline,
            messages,
            sync,
            peers,
            calls,
            network_timeout: config.network_timeout,
            transport_rx: Mutex::new(Some(transport_rx)),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Subscribe to our topics and start routing `inbound`, which must be the
    /// receiver paired with the pub/sub capability. Calling it twice does
    /// not start a second pump.
    pub async fn start(self: &Arc<Self>, inbound: mpsc::Receiver<InboundMessage>) -> Result<()> {
        let Some(transport_rx) = self.lock_transport().take() else {
            warn!("messenger already started");
            return Ok(());
        };

        let mut topics = vec![
            self.wallet.inbox_topic(),
            self.wallet.signal_topic(),
            TOPIC_PRESENCE.to_string(),
        ];
        topics.extend(self.conversations.list().iter().map(|c| c.id.to_topic()));
        for topic in &topics {
            tokio::time::timeout(self.network_timeout, self.caps.pubsub.subscribe(topic))
                .await
                .map_err(|_| TransportError::Timeout)??;
        }
        debug!(count = topics.len(), "topics subscribed");

        self.peers.spawn_event_pump(transport_rx);
        self.calls.spawn_peer_listener();

        let tasks = vec![
            self.spawn_dispatch(inbound),
            self.spawn_peer_forwarder(self.peers.subscribe()),
            self.spawn_call_forwarder(self.calls.subscribe()),
        ];
        self.lock_tasks().extend(tasks);
        Ok(())
    }

    /// Route one inbound payload. Malformed payloads and handler failures
    /// are logged and dropped.
    pub async fn dispatch(&self, inbound: InboundMessage) {
        let message = match WireMessage::from_bytes(&inbound.data) {
            Ok(message) => message,
            Err(e) => {
                debug!(topic = %inbound.topic, error = %e, "dropping undecodable payload");
                return;
            }
        };

        match message {
            WireMessage::MessageNotice(notice) => {
                match self.messages.handle_notice(&notice).await {
                    Ok(Some(_)) => self.follow(&notice.conversation_id).await,
                    Ok(None) => {}
                    Err(e) => {
                        warn!(conversation = %notice.conversation_id, cid = %notice.cid, error = %e, "notice rejected")
                    }
                }
            }
            WireMessage::Receipt(receipt) => {
                if let Err(e) = self.messages.handle_receipt(&receipt).await {
                    warn!(conversation = %receipt.conversation_id, error = %e, "receipt rejected");
                }
            }
            WireMessage::Typing(notice) => self.presence.handle_typing(&notice),
            WireMessage::Presence(notice) => self.presence.handle_presence(&notice),
            WireMessage::Signal(signal) => {
                if signal.target != self.wallet {
                    return;
                }
                if let Err(e) = self.peers.handle_signaling_message(signal).await {
                    warn!(error = %e, "signaling message rejected");
                }
            }
        }
    }

    /// Announce `peer:<wallet>` so others can resolve our keys.
    pub async fn publish_peer_record(&self) -> Result<()> {
        let record = self.keystore.identity()?.peer_record();
        let key = format!("{DIR_PEER_PREFIX}{}", self.wallet);
        self.caps
            .directory
            .announce(&key, serde_json::to_vec(&record)?)
            .await?;
        info!(wallet = %self.wallet.short(), "peer record published");
        Ok(())
    }

    /// Announce ourselves offline, hang up every connection and stop the
    /// background tasks.
    pub async fn shutdown(&self) {
        if let Err(e) = self.presence.broadcast(PresenceStatus::Offline).await {
            warn!(error = %e, "offline broadcast failed");
        }
        for call in self.calls.active_calls() {
            if let Err(e) = self.calls.end_call(&call.id).await {
                debug!(call = %call.id, error = %e, "could not end call");
            }
        }
        self.peers.close_all().await;
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
        info!(wallet = %self.wallet.short(), "messenger stopped");
    }

    pub fn wallet(&self) -> &WalletAddress {
        &self.wallet
    }

    pub fn identity(&self) -> Result<Identity> {
        self.keystore.identity()
    }

    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    pub fn subscribe_kind(&self, kind: EventKind) -> EventStream {
        self.events.subscribe_kind(kind)
    }

    // Conversations

    pub async fn get_or_create_direct(&self, wallet: &WalletAddress) -> Result<Conversation> {
        let conversation = self.conversations.get_or_create_direct(wallet).await?;
        self.follow(&conversation.id).await;
        Ok(conversation)
    }

    pub async fn create_group(&self, name: &str, wallets: &[WalletAddress]) -> Result<Conversation> {
        let conversation = self.conversations.create_group(name, wallets).await?;
        self.follow(&conversation.id).await;
        Ok(conversation)
    }

    pub async fn create_conversation(
        &self,
        conversation_type: ConversationType,
        wallets: &[WalletAddress],
        settings: Option<ConversationSettings>,
    ) -> Result<Conversation> {
        let conversation = self
            .conversations
            .create(conversation_type, wallets, settings)
            .await?;
        self.follow(&conversation.id).await;
        Ok(conversation)
    }

    pub fn conversation(&self, id: &ConversationId) -> Option<Conversation> {
        self.conversations.get(id)
    }

    pub fn list_conversations(&self) -> Vec<Conversation> {
        self.conversations.list()
    }

    pub fn update_settings(
        &self,
        id: &ConversationId,
        settings: ConversationSettings,
    ) -> Result<Conversation> {
        self.conversations.update_settings(id, settings)
    }

    pub fn archive(&self, id: &ConversationId, archived: bool) -> Result<Conversation> {
        self.conversations.archive(id, archived)
    }

    // Messages

    pub async fn send_message(&self, id: &ConversationId, text: &str) -> Result<SendResult> {
        self.messages.send(id, text, SendOptions::default()).await
    }

    pub async fn send_with(
        &self,
        id: &ConversationId,
        text: &str,
        options: SendOptions,
    ) -> Result<SendResult> {
        self.messages.send(id, text, options).await
    }

    pub async fn edit_message(
        &self,
        id: &ConversationId,
        original: MessageId,
        text: &str,
    ) -> Result<SendResult> {
        self.messages.edit(id, original, text).await
    }

    pub async fn delete_message(&self, id: &ConversationId, original: MessageId) -> Result<SendResult> {
        self.messages.delete(id, original).await
    }

    pub fn get_decrypted(&self, id: &ConversationId) -> Result<Vec<DecryptedMessage>> {
        self.messages.get_decrypted(id)
    }

    pub fn list_messages(&self, id: &ConversationId) -> Result<Vec<ChatMessage>> {
        self.messages.list_messages(id)
    }

    pub async fn mark_read(&self, id: &ConversationId) -> Result<usize> {
        self.messages.mark_read(id).await
    }

    pub async fn retry_pending(&self) -> Result<RetryReport> {
        self.messages.retry_pending().await
    }

    // Sync and presence

    pub async fn sync(&self) -> Result<SyncReport> {
        self.sync.sync_on_coming_online().await
    }

    pub async fn pull_conversation(&self, id: &ConversationId) -> Result<PullResult> {
        self.sync.pull_conversation(id).await
    }

    /// Drop expired entries from the queues we hold for others.
    pub fn prune_offline(&self) -> Result<usize> {
        self.offline.prune_expired()
    }

    pub async fn set_status(&self, status: PresenceStatus) -> Result<()> {
        self.presence.broadcast(status).await
    }

    pub async fn set_typing(&self, id: &ConversationId, typing: bool) -> Result<()> {
        self.presence.set_typing(id, typing).await
    }

    pub fn is_online(&self, wallet: &WalletAddress) -> bool {
        self.presence.check_online(wallet)
    }

    pub fn typing_in(&self, id: &ConversationId) -> Vec<WalletAddress> {
        self.presence.typing_in(id)
    }

    // Calls

    /// Ring every other participant of the conversation.
    pub async fn start_call(&self, id: &ConversationId, call_type: CallType) -> Result<CallInfo> {
        let conversation = self.conversations.require(id)?;
        let wallets = conversation
            .others(&self.wallet)
            .map(|p| p.wallet_address.clone())
            .collect();
        Ok(self.calls.start_call(id.clone(), wallets, call_type).await?)
    }

    pub async fn accept_call(&self, call_id: &CallId) -> Result<CallInfo> {
        Ok(self.calls.accept_call(call_id).await?)
    }

    pub async fn decline_call(&self, call_id: &CallId) -> Result<()> {
        Ok(self.calls.decline_call(call_id).await?)
    }

    pub async fn end_call(&self, call_id: &CallId) -> Result<()> {
        Ok(self.calls.end_call(call_id).await?)
    }

    /// Flip one of our media tracks; returns the new enabled state.
    pub fn toggle_media(&self, call_id: &CallId, kind: MediaKind) -> Result<bool> {
        Ok(self.calls.toggle_media(call_id, kind)?)
    }

    pub fn active_calls(&self) -> Vec<CallInfo> {
        self.calls.active_calls()
    }

    pub fn call_history(&self) -> Vec<CallInfo> {
        self.calls.call_history()
    }

    // Components

    pub fn keystore(&self) -> &Arc<KeyStore> {
        &self.keystore
    }

    pub fn conversations(&self) -> &Arc<ConversationStore> {
        &self.conversations
    }

    pub fn messages(&self) -> &Arc<MessageEngine> {
        &self.messages
    }

    pub fn presence(&self) -> &Arc<PresenceBus> {
        &self.presence
    }

    pub fn offline(&self) -> &Arc<OfflineMessageQueue> {
        &self.offline
    }

    pub fn sync_coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.sync
    }

    pub fn peers(&self) -> &Arc<PeerConnectionManager> {
        &self.peers
    }

    pub fn calls(&self) -> &Arc<CallManager> {
        &self.calls
    }

    async fn follow(&self, id: &ConversationId) {
        let topic = id.to_topic();
        match tokio::time::timeout(self.network_timeout, self.caps.pubsub.subscribe(&topic)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(conversation = %id, error = %e, "could not subscribe to conversation")
            }
            Err(_) => warn!(conversation = %id, "conversation subscribe timed out"),
        }
    }

    fn spawn_dispatch(self: &Arc<Self>, mut inbound: mpsc::Receiver<InboundMessage>) -> JoinHandle<()> {
        let messenger = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                let Some(messenger) = messenger.upgrade() else {
                    break;
                };
                messenger.dispatch(message).await;
            }
            debug!("inbound stream closed");
        })
    }

    fn spawn_peer_forwarder(&self, mut rx: broadcast::Receiver<PeerEvent>) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(PeerEvent::StateChanged { wallet, state, .. }) => {
                        events.publish(EngineEvent::Peer { wallet, state });
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "peer event forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_call_forwarder(&self, mut rx: broadcast::Receiver<CallEvent>) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(CallEvent::Incoming(call)) => events.publish(EngineEvent::IncomingCall {
                        call_id: call.id,
                        from: call.initiator,
                        call_type: call.call_type,
                    }),
                    Ok(CallEvent::StateChanged { call_id, state }) => {
                        events.publish(EngineEvent::Call { call_id, state })
                    }
                    Ok(CallEvent::Ended(call)) => events.publish(EngineEvent::Call {
                        call_id: call.id,
                        state: CallState::Ended,
                    }),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "call event forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn lock_transport(
        &self,
    ) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedReceiver<TransportEvent>>> {
        self.transport_rx.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
    }
}
