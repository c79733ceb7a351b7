//! Peer connection lifecycle.
//!
//! At most one connection exists per remote wallet. Connecting again closes
//! and replaces the existing one. Connection state only moves along
//! [`ConnectionState::can_transition_to`]; backend callbacks that would
//! break the table are logged and dropped.
//!
//! Signaling (offer / answer / ICE candidates / hangup) travels as
//! [`WireMessage::Signal`] on the remote wallet's signal topic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use cairn_shared::capability::PubSubTransport;
use cairn_shared::locks::KeyedLocks;
use cairn_shared::protocol::{CallOffer, SignalMessage, SignalType, WireMessage};
use cairn_shared::types::WalletAddress;

use crate::backend::{IceCandidate, RtcBackend, RtcSession, SessionParams, TransportEvent};
use crate::error::PeerConnectionError;
use crate::ice::IceServerRegistry;

/// Label of the data channel opened alongside call offers
pub const SIGNAL_CHANNEL_LABEL: &str = "cairn-signal";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (New, Connecting | Connected | Failed | Closed)
                | (Connecting, Connected | Disconnected | Failed | Closed)
                | (Connected, Disconnected | Failed | Closed)
                // ICE may recover a dropped path
                | (Disconnected, Connecting | Connected | Failed | Closed)
                | (Failed, Closed)
        )
    }

    /// Terminal states release the connection's data channels.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Unknown,
    Good,
    Poor,
    Lost,
}

impl From<ConnectionState> for ConnectionQuality {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Connected => ConnectionQuality::Good,
            ConnectionState::Disconnected => ConnectionQuality::Poor,
            ConnectionState::Failed | ConnectionState::Closed => ConnectionQuality::Lost,
            _ => ConnectionQuality::Unknown,
        }
    }
}

/// Snapshot of one peer connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcPeerConnection {
    /// Shared by both ends: the offerer picks it
    pub id: String,
    pub local_peer_id: WalletAddress,
    pub remote_wallet_address: WalletAddress,
    pub connection_state: ConnectionState,
    pub data_channels: Vec<String>,
    pub quality: ConnectionQuality,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// We sent the offer
    pub initiator: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    StateChanged {
        wallet: WalletAddress,
        connection_id: String,
        state: ConnectionState,
    },
    /// A remote offer was answered
    IncomingOffer {
        wallet: WalletAddress,
        connection_id: String,
        call: Option<CallOffer>,
    },
    RemoteHangup {
        wallet: WalletAddress,
        connection_id: String,
    },
}

struct PeerConnection {
    info: WebRtcPeerConnection,
    session: Arc<dyn RtcSession>,
}

pub struct PeerConnectionManager {
    local_wallet: WalletAddress,
    backend: Arc<dyn RtcBackend>,
    signaling: Arc<dyn PubSubTransport>,
    ice: Arc<IceServerRegistry>,
    connections: Mutex<HashMap<WalletAddress, PeerConnection>>,
    wallet_locks: KeyedLocks<WalletAddress>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    events: broadcast::Sender<PeerEvent>,
}

impl PeerConnectionManager {
    /// The returned receiver carries backend callbacks; feed each one to
    /// [`handle_transport_event`](Self::handle_transport_event).
    pub fn new(
        local_wallet: WalletAddress,
        backend: Arc<dyn RtcBackend>,
        signaling: Arc<dyn PubSubTransport>,
        ice: Arc<IceServerRegistry>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let manager = Arc::new(Self {
            local_wallet,
            backend,
            signaling,
            ice,
            connections: Mutex::new(HashMap::new()),
            wallet_locks: KeyedLocks::new(),
            transport_tx,
            events,
        });
        (manager, transport_rx)
    }

    /// Drive transport events on a background task until the backend side
    /// of the channel closes.
    pub fn spawn_event_pump(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.handle_transport_event(event).await;
            }
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    pub fn local_wallet(&self) -> &WalletAddress {
        &self.local_wallet
    }

    pub fn ice_servers(&self) -> &Arc<IceServerRegistry> {
        &self.ice
    }

    pub fn connection(&self, wallet: &WalletAddress) -> Option<WebRtcPeerConnection> {
        self.lock_map()
            .get(wallet)
            .map(|c| c.info.clone())
    }

    pub fn connections(&self) -> Vec<WebRtcPeerConnection> {
        self.lock_map().values().map(|c| c.info.clone()).collect()
    }

    pub async fn connect_to_peer(
        &self,
        wallet: &WalletAddress,
        create_data_channel: bool,
    ) -> Result<String, PeerConnectionError> {
        self.open_connection(wallet, create_data_channel, None).await
    }

    /// Offer a connection carrying call metadata, always with the signaling
    /// data channel.
    pub async fn offer_call(
        &self,
        wallet: &WalletAddress,
        call: CallOffer,
    ) -> Result<String, PeerConnectionError> {
        self.open_connection(wallet, true, Some(call)).await
    }

    async fn open_connection(
        &self,
        wallet: &WalletAddress,
        create_data_channel: bool,
        call: Option<CallOffer>,
    ) -> Result<String, PeerConnectionError> {
        let _guard = self.wallet_locks.lock(wallet).await;

        if let Some(old) = self.take(wallet) {
            debug!(peer = %wallet.short(), "replacing existing connection");
            self.shutdown(wallet, old).await;
        }

        let connection_id = Uuid::new_v4().to_string();
        let session = self.new_session(wallet, &connection_id).await?;

        if create_data_channel {
            session.create_data_channel(SIGNAL_CHANNEL_LABEL).await?;
        }
        let sdp = session.create_offer().await?;

        self.insert(wallet, &connection_id, session.clone(), true);

        if let Err(e) = self
            .send_signal(wallet, &connection_id, SignalType::Offer { sdp, call })
            .await
        {
            if let Some(conn) = self.take(wallet) {
                self.shutdown(wallet, conn).await;
            }
            return Err(e);
        }

        info!(peer = %wallet.short(), connection = %connection_id, "offer sent");
        Ok(connection_id)
    }

    /// Dispatch a signaling message addressed to us. Unknown types are
    /// ignored.
    pub async fn handle_signaling_message(
        &self,
        msg: SignalMessage,
    ) -> Result<(), PeerConnectionError> {
        if msg.target != self.local_wallet || msg.sender == self.local_wallet {
            return Ok(());
        }

        match msg.signal_type {
            SignalType::Offer { sdp, call } => {
                self.on_remote_offer(msg.sender, msg.connection_id, sdp, call)
                    .await
            }
            SignalType::Answer { sdp } => {
                match self.session_for(&msg.sender, &msg.connection_id) {
                    Some(session) => session.set_remote_answer(&sdp).await,
                    None => {
                        debug!(peer = %msg.sender.short(), "answer for unknown connection");
                        Ok(())
                    }
                }
            }
            SignalType::IceCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => match self.session_for(&msg.sender, &msg.connection_id) {
                Some(session) => {
                    session
                        .add_ice_candidate(IceCandidate {
                            candidate,
                            sdp_mid,
                            sdp_mline_index,
                        })
                        .await
                }
                None => {
                    debug!(peer = %msg.sender.short(), "candidate for unknown connection");
                    Ok(())
                }
            },
            SignalType::Hangup => {
                let _guard = self.wallet_locks.lock(&msg.sender).await;
                if self.session_for(&msg.sender, &msg.connection_id).is_some() {
                    if let Some(conn) = self.take(&msg.sender) {
                        self.shutdown(&msg.sender, conn).await;
                    }
                    let _ = self.events.send(PeerEvent::RemoteHangup {
                        wallet: msg.sender,
                        connection_id: msg.connection_id,
                    });
                }
                Ok(())
            }
            SignalType::Unknown => {
                debug!(peer = %msg.sender.short(), "ignoring unknown signal type");
                Ok(())
            }
        }
    }

    async fn on_remote_offer(
        &self,
        sender: WalletAddress,
        connection_id: String,
        sdp: String,
        call: Option<CallOffer>,
    ) -> Result<(), PeerConnectionError> {
        let _guard = self.wallet_locks.lock(&sender).await;

        let existing = self.connection(&sender);
        if let Some(existing) = existing {
            if existing.id == connection_id {
                debug!(peer = %sender.short(), "duplicate offer");
                return Ok(());
            }
            let offer_pending = existing.initiator
                && matches!(
                    existing.connection_state,
                    ConnectionState::New | ConnectionState::Connecting
                );
            // Glare: both sides offered. The greater wallet keeps its offer.
            if offer_pending && self.local_wallet > sender {
                debug!(peer = %sender.short(), "glare, keeping our offer");
                return Ok(());
            }
            if let Some(old) = self.take(&sender) {
                self.shutdown(&sender, old).await;
            }
        }

        let session = self.new_session(&sender, &connection_id).await?;
        session.set_remote_offer(&sdp).await?;
        let answer = session.create_answer().await?;

        self.insert(&sender, &connection_id, session, false);
        let _ = self.events.send(PeerEvent::IncomingOffer {
            wallet: sender.clone(),
            connection_id: connection_id.clone(),
            call,
        });

        self.send_signal(&sender, &connection_id, SignalType::Answer { sdp: answer })
            .await?;
        info!(peer = %sender.short(), connection = %connection_id, "answer sent");
        Ok(())
    }

    /// Apply a backend callback. Events from a connection that has since
    /// been replaced are dropped.
    pub async fn handle_transport_event(&self, event: TransportEvent) {
        let wallet = event.wallet().clone();
        if self.current_id(&wallet).as_deref() != Some(event.connection_id()) {
            debug!(peer = %wallet.short(), "stale transport event");
            return;
        }

        match event {
            TransportEvent::StateChanged {
                connection_id,
                state,
                ..
            } => {
                let released = {
                    let mut map = self.lock_map();
                    let Some(conn) = map.get_mut(&wallet) else {
                        return;
                    };
                    let current = conn.info.connection_state;
                    if current == state {
                        return;
                    }
                    if !current.can_transition_to(state) {
                        warn!(
                            peer = %wallet.short(),
                            from = ?current,
                            to = ?state,
                            "rejecting illegal connection transition"
                        );
                        return;
                    }
                    conn.info.connection_state = state;
                    conn.info.quality = state.into();
                    if state.is_terminal() {
                        map.remove(&wallet)
                    } else {
                        None
                    }
                };

                if let Some(conn) = released {
                    if let Err(e) = conn.session.close().await {
                        debug!(peer = %wallet.short(), error = %e, "close after terminal state");
                    }
                }

                debug!(peer = %wallet.short(), state = ?state, "connection state");
                let _ = self.events.send(PeerEvent::StateChanged {
                    wallet,
                    connection_id,
                    state,
                });
            }
            TransportEvent::LocalCandidate {
                connection_id,
                candidate,
                ..
            } => {
                let signal = SignalType::IceCandidate {
                    candidate: candidate.candidate,
                    sdp_mid: candidate.sdp_mid,
                    sdp_mline_index: candidate.sdp_mline_index,
                };
                if let Err(e) = self.send_signal(&wallet, &connection_id, signal).await {
                    debug!(peer = %wallet.short(), error = %e, "candidate not sent");
                }
            }
            TransportEvent::DataChannelOpened { label, .. } => {
                if let Some(conn) = self.lock_map().get_mut(&wallet) {
                    if !conn.info.data_channels.contains(&label) {
                        conn.info.data_channels.push(label);
                    }
                }
            }
            TransportEvent::DataChannelClosed { label, .. } => {
                if let Some(conn) = self.lock_map().get_mut(&wallet) {
                    conn.info.data_channels.retain(|l| l != &label);
                }
            }
            TransportEvent::Received { bytes, .. } => {
                if let Some(conn) = self.lock_map().get_mut(&wallet) {
                    conn.info.bytes_received += bytes as u64;
                }
            }
        }
    }

    pub async fn send_data(
        &self,
        wallet: &WalletAddress,
        label: &str,
        data: &[u8],
    ) -> Result<(), PeerConnectionError> {
        let session = self
            .lock_map()
            .get(wallet)
            .map(|c| c.session.clone())
            .ok_or_else(|| PeerConnectionError::PeerNotFound(wallet.to_string()))?;
        let written = session.send_data(label, data).await?;
        if let Some(conn) = self.lock_map().get_mut(wallet) {
            conn.info.bytes_sent += written as u64;
        }
        Ok(())
    }

    /// Hang up and close the connection to `wallet`. Returns whether one
    /// existed.
    pub async fn close_connection(&self, wallet: &WalletAddress) -> bool {
        let _guard = self.wallet_locks.lock(wallet).await;
        let Some(conn) = self.take(wallet) else {
            return false;
        };
        let connection_id = conn.info.id.clone();
        if let Err(e) = self
            .send_signal(wallet, &connection_id, SignalType::Hangup)
            .await
        {
            debug!(peer = %wallet.short(), error = %e, "hangup not delivered");
        }
        self.shutdown(wallet, conn).await;
        true
    }

    pub async fn close_all(&self) {
        let wallets: Vec<WalletAddress> = self.lock_map().keys().cloned().collect();
        for wallet in wallets {
            self.close_connection(&wallet).await;
        }
    }

    async fn new_session(
        &self,
        wallet: &WalletAddress,
        connection_id: &str,
    ) -> Result<Arc<dyn RtcSession>, PeerConnectionError> {
        let params = SessionParams {
            remote: wallet.clone(),
            connection_id: connection_id.to_string(),
            ice_servers: self.ice.select(&self.local_wallet, Utc::now()),
        };
        self.backend
            .create_session(params, self.transport_tx.clone())
            .await
    }

    fn insert(
        &self,
        wallet: &WalletAddress,
        connection_id: &str,
        session: Arc<dyn RtcSession>,
        initiator: bool,
    ) {
        let info = WebRtcPeerConnection {
            id: connection_id.to_string(),
            local_peer_id: self.local_wallet.clone(),
            remote_wallet_address: wallet.clone(),
            connection_state: ConnectionState::New,
            data_channels: Vec::new(),
            quality: ConnectionQuality::Unknown,
            bytes_sent: 0,
            bytes_received: 0,
            initiator,
            created_at: Utc::now(),
        };
        self.lock_map()
            .insert(wallet.clone(), PeerConnection { info, session });
    }

    fn take(&self, wallet: &WalletAddress) -> Option<PeerConnection> {
        self.lock_map().remove(wallet)
    }

    /// Close channels and connection, then report `Closed`.
    async fn shutdown(&self, wallet: &WalletAddress, conn: PeerConnection) {
        if let Err(e) = conn.session.close().await {
            warn!(peer = %wallet.short(), error = %e, "error closing connection");
        }
        let _ = self.events.send(PeerEvent::StateChanged {
            wallet: wallet.clone(),
            connection_id: conn.info.id,
            state: ConnectionState::Closed,
        });
    }

    fn current_id(&self, wallet: &WalletAddress) -> Option<String> {
        self.lock_map().get(wallet).map(|c| c.info.id.clone())
    }

    fn session_for(&self, wallet: &WalletAddress, connection_id: &str) -> Option<Arc<dyn RtcSession>> {
        self.lock_map()
            .get(wallet)
            .filter(|c| c.info.id == connection_id)
            .map(|c| c.session.clone())
    }

    async fn send_signal(
        &self,
        target: &WalletAddress,
        connection_id: &str,
        signal_type: SignalType,
    ) -> Result<(), PeerConnectionError> {
        let msg = WireMessage::Signal(SignalMessage {
            sender: self.local_wallet.clone(),
            target: target.clone(),
            connection_id: connection_id.to_string(),
            signal_type,
        });
        let bytes = msg
            .to_bytes()
            .map_err(|e| PeerConnectionError::Signaling(e.to_string()))?;
        self.signaling
            .publish(&target.signal_topic(), bytes)
            .await
            .map_err(|e| PeerConnectionError::Signaling(e.to_string()))
    }

    fn lock_map(&self) -> std::sync::MutexGuard<'_, HashMap<WalletAddress, PeerConnection>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{ScriptedBackend, SignalOutbox};

    struct Side {
        manager: Arc<PeerConnectionManager>,
        backend: Arc<ScriptedBackend>,
        outbox: Arc<SignalOutbox>,
        rx: mpsc::UnboundedReceiver<TransportEvent>,
    }

    impl Side {
        fn new(wallet: &WalletAddress, auto_connect: bool) -> Self {
            let backend = Arc::new(if auto_connect {
                ScriptedBackend::auto_connecting()
            } else {
                ScriptedBackend::new()
            });
            let outbox = Arc::new(SignalOutbox::new());
            let (manager, rx) = PeerConnectionManager::new(
                wallet.clone(),
                backend.clone(),
                outbox.clone(),
                Arc::new(IceServerRegistry::new()),
            );
            Self {
                manager,
                backend,
                outbox,
                rx,
            }
        }

        async fn pump(&mut self) {
            while let Ok(ev) = self.rx.try_recv() {
                self.manager.handle_transport_event(ev).await;
            }
        }
    }

    fn wallet(c: char) -> WalletAddress {
        WalletAddress::parse(&format!("0x{}", c.to_string().repeat(40))).unwrap()
    }

    /// Deliver everything each side has published to the other until quiet.
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
                b.manager.handle_signaling_message(msg).await.unwrap();
            }
            for msg in to_a {
                a.manager.handle_signaling_message(msg).await.unwrap();
            }
        }
    }

    #[test]
    fn test_transition_table() {
        use ConnectionState::*;
        assert!(New.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(Connected));
        assert!(!Closed.can_transition_to(Connecting));
        assert!(!Failed.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(New));
        assert!(Failed.is_terminal() && Closed.is_terminal());
    }

    #[tokio::test]
    async fn test_offer_answer_connects() {
        let (wa, wb) = (wallet('a'), wallet('b'));
        let mut a = Side::new(&wa, true);
        let mut b = Side::new(&wb, true);

        let id = a.manager.connect_to_peer(&wb, true).await.unwrap();
        exchange(&mut a, &mut b).await;

        let ca = a.manager.connection(&wb).unwrap();
        let cb = b.manager.connection(&wa).unwrap();
        assert_eq!(ca.id, id);
        assert_eq!(cb.id, id);
        assert_eq!(ca.connection_state, ConnectionState::Connected);
        assert_eq!(cb.connection_state, ConnectionState::Connected);
        assert!(ca.initiator && !cb.initiator);
        assert_eq!(ca.data_channels, vec![SIGNAL_CHANNEL_LABEL.to_string()]);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_connection() {
        let wb = wallet('b');
        let mut a = Side::new(&wallet('a'), false);

        let first = a.manager.connect_to_peer(&wb, true).await.unwrap();
        let second = a.manager.connect_to_peer(&wb, false).await.unwrap();
        a.pump().await;

        assert_ne!(first, second);
        assert_eq!(a.manager.connections().len(), 1);
        assert_eq!(a.manager.connection(&wb).unwrap().id, second);
        assert!(a.backend.session(&first).unwrap().log().closed);
        assert!(!a.backend.session(&second).unwrap().log().closed);
    }

    #[tokio::test]
    async fn test_glare_yields_single_connection() {
        let (wa, wb) = (wallet('a'), wallet('b'));
        let mut a = Side::new(&wa, true);
        let mut b = Side::new(&wb, true);

        let id_a = a.manager.connect_to_peer(&wb, false).await.unwrap();
        let _id_b = b.manager.connect_to_peer(&wa, false).await.unwrap();
        exchange(&mut a, &mut b).await;

        // b > a, so b's offer wins on both sides
        let ca = a.manager.connection(&wb).unwrap();
        let cb = b.manager.connection(&wa).unwrap();
        assert_eq!(ca.id, cb.id);
        assert_ne!(ca.id, id_a);
        assert_eq!(ca.connection_state, ConnectionState::Connected);
        assert_eq!(cb.connection_state, ConnectionState::Connected);
        assert_eq!(a.manager.connections().len(), 1);
        assert_eq!(b.manager.connections().len(), 1);
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let wb = wallet('b');
        let mut a = Side::new(&wallet('a'), false);
        let id = a.manager.connect_to_peer(&wb, false).await.unwrap();
        a.pump().await;

        let session = a.backend.session(&id).unwrap();
        session.emit_state(ConnectionState::Connected);
        session.emit_state(ConnectionState::New);
        a.pump().await;

        assert_eq!(
            a.manager.connection(&wb).unwrap().connection_state,
            ConnectionState::Connected
        );
    }

    #[tokio::test]
    async fn test_terminal_state_releases_channels() {
        let wb = wallet('b');
        let mut a = Side::new(&wallet('a'), false);
        let mut events = a.manager.subscribe();
        let id = a.manager.connect_to_peer(&wb, true).await.unwrap();

        let session = a.backend.session(&id).unwrap();
        session.emit_state(ConnectionState::Failed);
        a.pump().await;

        assert!(a.manager.connection(&wb).is_none());
        assert!(session.log().closed);
        assert!(session.log().channels.values().all(|open| !open));

        let mut saw_failed = false;
        while let Ok(ev) = events.try_recv() {
            if let PeerEvent::StateChanged { state: ConnectionState::Failed, .. } = ev {
                saw_failed = true;
            }
        }
        assert!(saw_failed);
    }

    #[tokio::test]
    async fn test_stale_events_ignored() {
        let wb = wallet('b');
        let mut a = Side::new(&wallet('a'), false);
        let first = a.manager.connect_to_peer(&wb, false).await.unwrap();
        let _second = a.manager.connect_to_peer(&wb, false).await.unwrap();

        a.backend
            .session(&first)
            .unwrap()
            .emit_state(ConnectionState::Failed);
        a.pump().await;

        assert!(a.manager.connection(&wb).is_some());
    }

    #[tokio::test]
    async fn test_local_candidates_are_signaled() {
        let wb = wallet('b');
        let mut a = Side::new(&wallet('a'), false);
        let id = a.manager.connect_to_peer(&wb, false).await.unwrap();
        a.outbox.drain_signals();

        a.backend.session(&id).unwrap().emit_candidate(IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        });
        a.pump().await;

        let sent = a.outbox.drain_signals();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].signal_type, SignalType::IceCandidate { .. }));
        assert_eq!(sent[0].target, wb);
    }

    #[tokio::test]
    async fn test_unknown_and_misaddressed_signals_ignored() {
        let (wa, wb) = (wallet('a'), wallet('b'));
        let a = Side::new(&wa, false);

        let unknown = SignalMessage {
            sender: wb.clone(),
            target: wa.clone(),
            connection_id: "x".into(),
            signal_type: SignalType::Unknown,
        };
        assert!(a.manager.handle_signaling_message(unknown).await.is_ok());

        let not_for_us = SignalMessage {
            sender: wb.clone(),
            target: wallet('c'),
            connection_id: "x".into(),
            signal_type: SignalType::Offer {
                sdp: "offer".into(),
                call: None,
            },
        };
        a.manager.handle_signaling_message(not_for_us).await.unwrap();
        assert!(a.manager.connections().is_empty());
    }

    #[tokio::test]
    async fn test_failed_offer_publish_leaves_no_connection() {
        let wb = wallet('b');
        let a = Side::new(&wallet('a'), false);
        a.outbox.set_failing(true);

        let err = a.manager.connect_to_peer(&wb, true).await.unwrap_err();
        assert!(matches!(err, PeerConnectionError::Signaling(_)));
        assert!(a.manager.connection(&wb).is_none());
        assert!(a.backend.sessions()[0].log().closed);
    }

    #[tokio::test]
    async fn test_close_connection_hangs_up() {
        let (wa, wb) = (wallet('a'), wallet('b'));
        let mut a = Side::new(&wa, true);
        let mut b = Side::new(&wb, true);

        a.manager.connect_to_peer(&wb, true).await.unwrap();
        exchange(&mut a, &mut b).await;

        assert!(a.manager.close_connection(&wb).await);
        assert!(!a.manager.close_connection(&wb).await);
        exchange(&mut a, &mut b).await;

        assert!(a.manager.connection(&wb).is_none());
        assert!(b.manager.connection(&wa).is_none());
    }
}
