//! Call lifecycle on top of [`PeerConnectionManager`].
//!
//! A call owns one peer connection per remote participant. Participant
//! connection state feeds the call state; the call ends on its own once the
//! last remote participant is gone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use cairn_shared::protocol::{CallOffer, CallType};
use cairn_shared::types::{CallId, ConversationId, WalletAddress};
use cairn_store::records::RecordStoreExt;
use cairn_store::RecordStore;

use crate::error::CallError;
use crate::peer::{ConnectionState, PeerConnectionManager, PeerEvent};

/// Record namespace for ended calls
pub const CALLS_NAMESPACE: &str = "calls";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallState {
    Idle,
    Ringing,
    Connecting,
    Connected,
    Reconnecting,
    OnHold,
    Ended,
}

impl CallState {
    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        matches!(
            (self, next),
            (Idle, Ringing | Connecting | Ended)
                | (Ringing, Connecting | Ended)
                | (Connecting, Connected | Reconnecting | Ended)
                | (Connected, Reconnecting | OnHold | Ended)
                | (Reconnecting, Connected | Ended)
                | (OnHold, Connected | Ended)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
    Screen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallParticipant {
    pub wallet_address: WalletAddress,
    /// Peer connection carrying this participant; `None` for ourselves
    pub connection_id: Option<String>,
    pub connection_state: ConnectionState,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    pub is_speaking: bool,
    pub joined_at: DateTime<Utc>,
}

impl CallParticipant {
    fn new(wallet: WalletAddress, call_type: CallType) -> Self {
        Self {
            wallet_address: wallet,
            connection_id: None,
            connection_state: ConnectionState::New,
            audio_enabled: true,
            video_enabled: call_type == CallType::Video,
            screen_sharing: call_type == CallType::Screen,
            is_speaking: false,
            joined_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInfo {
    pub id: CallId,
    pub conversation_id: ConversationId,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub state: CallState,
    pub initiator: WalletAddress,
    /// Local participant first
    pub participants: Vec<CallParticipant>,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallInfo {
    fn remote_participants(&self) -> impl Iterator<Item = &CallParticipant> {
        self.participants.iter().skip(1)
    }

    fn participant_mut(&mut self, wallet: &WalletAddress) -> Option<&mut CallParticipant> {
        self.participants
            .iter_mut()
            .find(|p| &p.wallet_address == wallet)
    }

    fn advance(&mut self, next: CallState) -> Result<(), CallError> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(CallError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        match next {
            CallState::Connected if self.connected_at.is_none() => {
                self.connected_at = Some(Utc::now())
            }
            CallState::Ended => self.ended_at = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Incoming(CallInfo),
    StateChanged { call_id: CallId, state: CallState },
    ParticipantUpdated { call_id: CallId, participant: CallParticipant },
    ParticipantLeft { call_id: CallId, wallet: WalletAddress },
    Ended(CallInfo),
}

pub struct CallManager {
    local_wallet: WalletAddress,
    peers: Arc<PeerConnectionManager>,
    records: Arc<dyn RecordStore>,
    active: Mutex<HashMap<CallId, CallInfo>>,
    history: Mutex<Vec<CallInfo>>,
    events: broadcast::Sender<CallEvent>,
}

impl CallManager {
    /// Previously archived calls are loaded into [`call_history`](Self::call_history).
    pub fn new(peers: Arc<PeerConnectionManager>, records: Arc<dyn RecordStore>) -> Arc<Self> {
        let history: Vec<CallInfo> = records
            .list_json(CALLS_NAMESPACE)
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to load call history");
                Vec::new()
            });
        let (events, _) = broadcast::channel(128);
        Arc::new(Self {
            local_wallet: peers.local_wallet().clone(),
            peers,
            records,
            active: Mutex::new(HashMap::new()),
            history: Mutex::new(history),
            events,
        })
    }

    /// Follow peer connection events until the manager is dropped.
    pub fn spawn_peer_listener(self: &Arc<Self>) {
        let mut rx = self.peers.subscribe();
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        manager.handle_peer_event(event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "call manager lagged behind peer events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn call(&self, call_id: &CallId) -> Option<CallInfo> {
        self.lock_active().get(call_id).cloned()
    }

    pub fn active_calls(&self) -> Vec<CallInfo> {
        self.lock_active().values().cloned().collect()
    }

    /// Ended calls, oldest first.
    pub fn call_history(&self) -> Vec<CallInfo> {
        let mut history = self.lock_history().clone();
        history.sort_by_key(|c| c.started_at);
        history
    }

    /// Ring `wallets` with a call-typed offer each. Fails only if no offer
    /// could be sent at all.
    pub async fn start_call(
        &self,
        conversation_id: ConversationId,
        wallets: Vec<WalletAddress>,
        call_type: CallType,
    ) -> Result<CallInfo, CallError> {
        let mut remotes: Vec<WalletAddress> = wallets
            .into_iter()
            .filter(|w| w != &self.local_wallet)
            .collect();
        remotes.sort();
        remotes.dedup();
        if remotes.is_empty() {
            return Err(CallError::NoParticipants);
        }

        let call_id = CallId::new();
        let mut call = CallInfo {
            id: call_id,
            conversation_id: conversation_id.clone(),
            call_type,
            state: CallState::Idle,
            initiator: self.local_wallet.clone(),
            participants: vec![CallParticipant::new(self.local_wallet.clone(), call_type)],
            started_at: Utc::now(),
            connected_at: None,
            ended_at: None,
        };
        call.participants.extend(
            remotes
                .iter()
                .map(|w| CallParticipant::new(w.clone(), call_type)),
        );
        call.advance(CallState::Connecting)?;
        self.lock_active().insert(call_id, call);

        let offer = CallOffer {
            call_id,
            conversation_id,
            call_type,
        };
        let mut last_err = None;
        let mut offered = 0;
        for wallet in &remotes {
            match self.peers.offer_call(wallet, offer.clone()).await {
                Ok(connection_id) => {
                    offered += 1;
                    if let Some(p) = self
                        .lock_active()
                        .get_mut(&call_id)
                        .and_then(|c| c.participant_mut(wallet))
                    {
                        p.connection_id = Some(connection_id);
                    }
                }
                Err(e) => {
                    warn!(call = %call_id, peer = %wallet.short(), error = %e, "call offer failed");
                    if let Some(c) = self.lock_active().get_mut(&call_id) {
                        c.participants.retain(|p| &p.wallet_address != wallet);
                    }
                    last_err = Some(e);
                }
            }
        }

        if offered == 0 {
            self.end_call(&call_id).await?;
            return Err(last_err.map(CallError::from).unwrap_or(CallError::NoParticipants));
        }

        info!(call = %call_id, participants = offered, "call started");
        self.call(&call_id).ok_or(CallError::NotFound(call_id))
    }

    pub async fn accept_call(&self, call_id: &CallId) -> Result<CallInfo, CallError> {
        let info = {
            let mut active = self.lock_active();
            let call = active
                .get_mut(call_id)
                .ok_or(CallError::NotFound(*call_id))?;
            call.advance(CallState::Connecting)?;
            // The transport may have finished while we were ringing
            if call
                .remote_participants()
                .any(|p| p.connection_state == ConnectionState::Connected)
            {
                call.advance(CallState::Connected)?;
            }
            call.clone()
        };
        self.emit_state(&info);
        Ok(info)
    }

    pub async fn decline_call(&self, call_id: &CallId) -> Result<(), CallError> {
        self.end_call(call_id).await
    }

    /// Close every participant connection, archive the call and drop it from
    /// the active set. Ending a call that already ended is a no-op.
    pub async fn end_call(&self, call_id: &CallId) -> Result<(), CallError> {
        let call = {
            let mut active = self.lock_active();
            match active.get_mut(call_id) {
                Some(call) if call.state == CallState::Ended => return Ok(()),
                Some(call) => {
                    call.advance(CallState::Ended)?;
                    call.clone()
                }
                None => {
                    if self.lock_history().iter().any(|c| &c.id == call_id) {
                        return Ok(());
                    }
                    return Err(CallError::NotFound(*call_id));
                }
            }
        };

        for participant in call.remote_participants() {
            let current = self
                .peers
                .connection(&participant.wallet_address)
                .map(|c| c.id);
            if current.is_some() && current == participant.connection_id {
                self.peers.close_connection(&participant.wallet_address).await;
            }
        }

        let archived = self
            .records
            .put_json(CALLS_NAMESPACE, &call.id.to_string(), &call);
        self.lock_active().remove(call_id);
        self.lock_history().push(call.clone());

        info!(call = %call.id, "call ended");
        let _ = self.events.send(CallEvent::Ended(call));
        archived.map_err(CallError::from)
    }

    /// Flip one of the local participant's media flags; returns the new value.
    pub fn toggle_media(&self, call_id: &CallId, kind: MediaKind) -> Result<bool, CallError> {
        let local = self.local_wallet.clone();
        self.update_participant(call_id, &local, |p| {
            let flag = match kind {
                MediaKind::Audio => &mut p.audio_enabled,
                MediaKind::Video => &mut p.video_enabled,
                MediaKind::Screen => &mut p.screen_sharing,
            };
            *flag = !*flag;
            *flag
        })
    }

    pub fn set_speaking(
        &self,
        call_id: &CallId,
        wallet: &WalletAddress,
        speaking: bool,
    ) -> Result<(), CallError> {
        self.update_participant(call_id, wallet, |p| p.is_speaking = speaking)
    }

    pub fn hold(&self, call_id: &CallId) -> Result<(), CallError> {
        self.set_state(call_id, CallState::OnHold)
    }

    pub fn resume(&self, call_id: &CallId) -> Result<(), CallError> {
        self.set_state(call_id, CallState::Connected)
    }

    pub async fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::IncomingOffer {
                wallet,
                connection_id,
                call: Some(offer),
            } => self.on_incoming_offer(wallet, connection_id, offer),
            PeerEvent::IncomingOffer { call: None, .. } => {}
            PeerEvent::StateChanged {
                wallet,
                connection_id,
                state,
            } => self.on_connection_state(&wallet, &connection_id, state).await,
            PeerEvent::RemoteHangup {
                wallet,
                connection_id,
            } => {
                self.on_connection_state(&wallet, &connection_id, ConnectionState::Closed)
                    .await
            }
        }
    }

    fn on_incoming_offer(&self, wallet: WalletAddress, connection_id: String, offer: CallOffer) {
        let mut participant = CallParticipant::new(wallet.clone(), offer.call_type);
        participant.connection_id = Some(connection_id);

        let mut active = self.lock_active();
        if let Some(call) = active.get_mut(&offer.call_id) {
            // Another member of a group call we already know about
            match call.participant_mut(&wallet) {
                Some(existing) => *existing = participant,
                None => call.participants.push(participant),
            }
            return;
        }

        let mut call = CallInfo {
            id: offer.call_id,
            conversation_id: offer.conversation_id,
            call_type: offer.call_type,
            state: CallState::Idle,
            initiator: wallet.clone(),
            participants: vec![
                CallParticipant::new(self.local_wallet.clone(), offer.call_type),
                participant,
            ],
            started_at: Utc::now(),
            connected_at: None,
            ended_at: None,
        };
        if let Err(e) = call.advance(CallState::Ringing) {
            warn!(call = %call.id, error = %e, "cannot ring");
            return;
        }
        active.insert(call.id, call.clone());
        drop(active);

        info!(call = %call.id, from = %wallet.short(), "incoming call");
        let _ = self.events.send(CallEvent::Incoming(call));
    }

    async fn on_connection_state(
        &self,
        wallet: &WalletAddress,
        connection_id: &str,
        state: ConnectionState,
    ) {
        let mut to_end = Vec::new();
        let mut notices = Vec::new();
        {
            let mut active = self.lock_active();
            for call in active.values_mut() {
                if call.state == CallState::Ended {
                    continue;
                }
                let Some(participant) = call.participant_mut(wallet) else {
                    continue;
                };
                if participant.connection_id.as_deref() != Some(connection_id) {
                    continue;
                }
                participant.connection_state = state;
                let participant = participant.clone();

                let next = match state {
                    ConnectionState::Connected => match call.state {
                        CallState::Connecting | CallState::Reconnecting => Some(CallState::Connected),
                        _ => None,
                    },
                    ConnectionState::Disconnected if call.state == CallState::Connected => {
                        Some(CallState::Reconnecting)
                    }
                    _ => None,
                };

                if state.is_terminal() {
                    call.participants.retain(|p| &p.wallet_address != wallet);
                    notices.push(CallEvent::ParticipantLeft {
                        call_id: call.id,
                        wallet: wallet.clone(),
                    });
                    if call.remote_participants().next().is_none() {
                        to_end.push(call.id);
                    }
                } else {
                    notices.push(CallEvent::ParticipantUpdated {
                        call_id: call.id,
                        participant,
                    });
                }

                if let Some(next) = next {
                    match call.advance(next) {
                        Ok(()) => notices.push(CallEvent::StateChanged {
                            call_id: call.id,
                            state: next,
                        }),
                        Err(e) => debug!(call = %call.id, error = %e, "call state unchanged"),
                    }
                }
            }
        }

        for notice in notices {
            let _ = self.events.send(notice);
        }
        for call_id in to_end {
            if let Err(e) = self.end_call(&call_id).await {
                warn!(call = %call_id, error = %e, "failed to end call");
            }
        }
    }

    fn set_state(&self, call_id: &CallId, next: CallState) -> Result<(), CallError> {
        let info = {
            let mut active = self.lock_active();
            let call = active
                .get_mut(call_id)
                .ok_or(CallError::NotFound(*call_id))?;
            call.advance(next)?;
            call.clone()
        };
        self.emit_state(&info);
        Ok(())
    }

    fn update_participant<T>(
        &self,
        call_id: &CallId,
        wallet: &WalletAddress,
        f: impl FnOnce(&mut CallParticipant) -> T,
    ) -> Result<T, CallError> {
        let (out, participant) = {
            let mut active = self.lock_active();
            let call = active
                .get_mut(call_id)
                .ok_or(CallError::NotFound(*call_id))?;
            let participant = call
                .participant_mut(wallet)
                .ok_or(CallError::NotFound(*call_id))?;
            let out = f(participant);
            (out, participant.clone())
        };
        let _ = self.events.send(CallEvent::ParticipantUpdated {
            call_id: *call_id,
            participant,
        });
        Ok(out)
    }

    fn emit_state(&self, call: &CallInfo) {
        let _ = self.events.send(CallEvent::StateChanged {
            call_id: call.id,
            state: call.state,
        });
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<CallId, CallInfo>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, Vec<CallInfo>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TransportEvent;
    use crate::ice::IceServerRegistry;
    use crate::scripted::{ScriptedBackend, SignalOutbox};
    use cairn_store::MemoryRecordStore;
    use tokio::sync::mpsc;

    struct Side {
        wallet: WalletAddress,
        peers: Arc<PeerConnectionManager>,
        calls: Arc<CallManager>,
        backend: Arc<ScriptedBackend>,
        outbox: Arc<SignalOutbox>,
        records: Arc<MemoryRecordStore>,
        transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
        peer_rx: broadcast::Receiver<PeerEvent>,
    }

    impl Side {
        fn new(c: char) -> Self {
            let wallet =
                WalletAddress::parse(&format!("0x{}", c.to_string().repeat(40))).unwrap();
            let backend = Arc::new(ScriptedBackend::auto_connecting());
            let outbox = Arc::new(SignalOutbox::new());
            let (peers, transport_rx) = PeerConnectionManager::new(
                wallet.clone(),
                backend.clone(),
                outbox.clone(),
                Arc::new(IceServerRegistry::new()),
            );
            let peer_rx = peers.subscribe();
            let records = Arc::new(MemoryRecordStore::new());
            let calls = CallManager::new(peers.clone(), records.clone());
            Self {
                wallet,
                peers,
                calls,
                backend,
                outbox,
                records,
                transport_rx,
                peer_rx,
            }
        }

        async fn pump(&mut self) {
            loop {
                let mut progressed = false;
                while let Ok(ev) = self.transport_rx.try_recv() {
                    self.peers.handle_transport_event(ev).await;
                    progressed = true;
                }
                while let Ok(ev) = self.peer_rx.try_recv() {
                    self.calls.handle_peer_event(ev).await;
                    progressed = true;
                }
                if !progressed {
                    break;
                }
            }
        }
    }

    async fn exchange(a: &mut Side, b: &mut Side) {
        for _ in 0..8 {
            a.pump().await;
            b.pump().await;
            let to_b = a.outbox.drain_signals();
            let to_a = b.outbox.drain_signals();
            if to_a.is_empty() && to_b.is_empty() {
                break;
            }
            for msg in to_b {
                b.peers.handle_signaling_message(msg).await.unwrap();
            }
            for msg in to_a {
                a.peers.handle_signaling_message(msg).await.unwrap();
            }
        }
        a.pump().await;
        b.pump().await;
    }

    fn conversation() -> ConversationId {
        ConversationId("conv-call".into())
    }

    #[test]
    fn test_call_transition_table() {
        use CallState::*;
        assert!(Idle.can_transition_to(Ringing));
        assert!(Ringing.can_transition_to(Connecting));
        assert!(Connected.can_transition_to(OnHold));
        assert!(OnHold.can_transition_to(Connected));
        assert!(!Ringing.can_transition_to(Connected));
        assert!(!Ended.can_transition_to(Connecting));
        assert!(!Idle.can_transition_to(Connected));
    }

    #[tokio::test]
    async fn test_call_rings_and_connects() {
        let mut a = Side::new('a');
        let mut b = Side::new('b');
        let mut b_events = b.calls.subscribe();

        let call = a
            .calls
            .start_call(conversation(), vec![b.wallet.clone()], CallType::Video)
            .await
            .unwrap();
        assert_eq!(call.state, CallState::Connecting);
        assert!(call.participants[0].video_enabled);

        exchange(&mut a, &mut b).await;

        let incoming = b.calls.call(&call.id).unwrap();
        assert_eq!(incoming.state, CallState::Ringing);
        assert_eq!(incoming.initiator, a.wallet);
        assert!(matches!(b_events.try_recv(), Ok(CallEvent::Incoming(_))));

        assert_eq!(a.calls.call(&call.id).unwrap().state, CallState::Connected);

        let accepted = b.calls.accept_call(&call.id).await.unwrap();
        assert_eq!(accepted.state, CallState::Connected);
        assert!(accepted.connected_at.is_some());

        // the call offer carried the signaling channel
        let session = a.backend.sessions().pop().unwrap();
        assert!(session
            .log()
            .channels
            .contains_key(crate::peer::SIGNAL_CHANNEL_LABEL));
    }

    #[tokio::test]
    async fn test_end_call_twice_archives_once() {
        let mut a = Side::new('a');
        let mut b = Side::new('b');
        let call = a
            .calls
            .start_call(conversation(), vec![b.wallet.clone()], CallType::Audio)
            .await
            .unwrap();
        exchange(&mut a, &mut b).await;

        a.calls.end_call(&call.id).await.unwrap();
        a.calls.end_call(&call.id).await.unwrap();

        assert!(a.calls.call(&call.id).is_none());
        assert_eq!(a.calls.call_history().len(), 1);
        assert_eq!(a.calls.call_history()[0].state, CallState::Ended);
        assert_eq!(a.records.list(CALLS_NAMESPACE).unwrap().len(), 1);
        assert!(a.peers.connection(&b.wallet).is_none());

        // the hangup ends the call on the other side too
        exchange(&mut a, &mut b).await;
        assert!(b.calls.call(&call.id).is_none());
        assert_eq!(b.calls.call_history().len(), 1);
    }

    #[tokio::test]
    async fn test_decline_closes_connection() {
        let mut a = Side::new('a');
        let mut b = Side::new('b');
        let call = a
            .calls
            .start_call(conversation(), vec![b.wallet.clone()], CallType::Audio)
            .await
            .unwrap();
        exchange(&mut a, &mut b).await;

        b.calls.decline_call(&call.id).await.unwrap();
        assert!(b.peers.connection(&a.wallet).is_none());

        exchange(&mut a, &mut b).await;
        assert!(a.calls.call(&call.id).is_none());
        assert_eq!(a.calls.call_history()[0].id, call.id);
    }

    #[tokio::test]
    async fn test_start_call_without_participants() {
        let a = Side::new('a');
        let err = a
            .calls
            .start_call(conversation(), vec![a.wallet.clone()], CallType::Audio)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::NoParticipants));
    }

    #[tokio::test]
    async fn test_start_call_fails_when_no_offer_sent() {
        let a = Side::new('a');
        a.outbox.set_failing(true);
        let remote = WalletAddress::parse("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb").unwrap();

        let err = a
            .calls
            .start_call(conversation(), vec![remote], CallType::Audio)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Peer(_)));
        assert!(a.calls.active_calls().is_empty());
        assert_eq!(a.calls.call_history().len(), 1);
    }

    #[tokio::test]
    async fn test_reconnecting_and_hold() {
        let mut a = Side::new('a');
        let mut b = Side::new('b');
        let call = a
            .calls
            .start_call(conversation(), vec![b.wallet.clone()], CallType::Audio)
            .await
            .unwrap();
        exchange(&mut a, &mut b).await;

        let conn_id = a.peers.connection(&b.wallet).unwrap().id;
        let session = a.backend.session(&conn_id).unwrap();

        session.emit_state(ConnectionState::Disconnected);
        a.pump().await;
        assert_eq!(a.calls.call(&call.id).unwrap().state, CallState::Reconnecting);

        session.emit_state(ConnectionState::Connected);
        a.pump().await;
        assert_eq!(a.calls.call(&call.id).unwrap().state, CallState::Connected);

        a.calls.hold(&call.id).unwrap();
        assert_eq!(a.calls.call(&call.id).unwrap().state, CallState::OnHold);
        a.calls.resume(&call.id).unwrap();
        assert_eq!(a.calls.call(&call.id).unwrap().state, CallState::Connected);
    }

    #[tokio::test]
    async fn test_media_toggles_and_speaking() {
        let mut a = Side::new('a');
        let mut b = Side::new('b');
        let call = a
            .calls
            .start_call(conversation(), vec![b.wallet.clone()], CallType::Audio)
            .await
            .unwrap();
        exchange(&mut a, &mut b).await;

        assert!(!a.calls.toggle_media(&call.id, MediaKind::Audio).unwrap());
        assert!(a.calls.toggle_media(&call.id, MediaKind::Screen).unwrap());
        a.calls.set_speaking(&call.id, &b.wallet, true).unwrap();

        let info = a.calls.call(&call.id).unwrap();
        assert!(!info.participants[0].audio_enabled);
        assert!(info.participants[0].screen_sharing);
        assert!(info.participants[1].is_speaking);
    }

    #[tokio::test]
    async fn test_history_reloaded_from_records() {
        let mut a = Side::new('a');
        let mut b = Side::new('b');
        let call = a
            .calls
            .start_call(conversation(), vec![b.wallet.clone()], CallType::Audio)
            .await
            .unwrap();
        exchange(&mut a, &mut b).await;
        a.calls.end_call(&call.id).await.unwrap();

        let reloaded = CallManager::new(a.peers.clone(), a.records.clone());
        assert_eq!(reloaded.call_history().len(), 1);
        assert!(reloaded.end_call(&call.id).await.is_ok());
    }
}
