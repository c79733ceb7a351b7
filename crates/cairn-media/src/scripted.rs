//! In-process [`RtcBackend`] with no network stack.
//!
//! Sessions record what the state machine asked of them and let the caller
//! inject backend callbacks. With `auto_connect` enabled a session reports
//! `Connected` as soon as it has both descriptions, which is enough to drive
//! signaling end-to-end between two managers in one process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use cairn_shared::capability::PubSubTransport;
use cairn_shared::error::TransportError;
use cairn_shared::protocol::{SignalMessage, WireMessage};
use cairn_shared::types::WalletAddress;

use crate::backend::{IceCandidate, RtcBackend, RtcSession, SessionParams, TransportEvent};
use crate::error::PeerConnectionError;
use crate::peer::ConnectionState;

#[derive(Default)]
pub struct ScriptedBackend {
    auto_connect: bool,
    sessions: Mutex<Vec<Arc<ScriptedSession>>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auto_connecting() -> Self {
        Self {
            auto_connect: true,
            ..Self::default()
        }
    }

    pub fn sessions(&self) -> Vec<Arc<ScriptedSession>> {
        self.sessions.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn session(&self, connection_id: &str) -> Option<Arc<ScriptedSession>> {
        self.sessions()
            .into_iter()
            .rev()
            .find(|s| s.connection_id == connection_id)
    }
}

#[async_trait]
impl RtcBackend for ScriptedBackend {
    async fn create_session(
        &self,
        params: SessionParams,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn RtcSession>, PeerConnectionError> {
        let session = Arc::new(ScriptedSession {
            remote: params.remote,
            connection_id: params.connection_id,
            auto_connect: self.auto_connect,
            events,
            log: Mutex::new(SessionLog::default()),
        });
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.push(session.clone());
        }
        Ok(session)
    }
}

#[derive(Debug, Default, Clone)]
pub struct SessionLog {
    pub local_sdp: Option<String>,
    pub remote_sdp: Option<String>,
    pub candidates: Vec<IceCandidate>,
    /// label -> open
    pub channels: HashMap<String, bool>,
    pub sent: Vec<(String, Vec<u8>)>,
    pub closed: bool,
}

pub struct ScriptedSession {
    pub remote: WalletAddress,
    pub connection_id: String,
    auto_connect: bool,
    events: mpsc::UnboundedSender<TransportEvent>,
    log: Mutex<SessionLog>,
}

impl ScriptedSession {
    pub fn log(&self) -> SessionLog {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn emit_state(&self, state: ConnectionState) {
        let _ = self.events.send(TransportEvent::StateChanged {
            wallet: self.remote.clone(),
            connection_id: self.connection_id.clone(),
            state,
        });
    }

    pub fn emit_candidate(&self, candidate: IceCandidate) {
        let _ = self.events.send(TransportEvent::LocalCandidate {
            wallet: self.remote.clone(),
            connection_id: self.connection_id.clone(),
            candidate,
        });
    }

    fn with_log<T>(&self, f: impl FnOnce(&mut SessionLog) -> T) -> Result<T, PeerConnectionError> {
        let mut log = self
            .log
            .lock()
            .map_err(|_| PeerConnectionError::WebRtc("session log poisoned".into()))?;
        if log.closed {
            return Err(PeerConnectionError::WebRtc("session closed".into()));
        }
        Ok(f(&mut log))
    }

    fn maybe_connect(&self) {
        if !self.auto_connect {
            return;
        }
        let log = self.log();
        if log.local_sdp.is_some() && log.remote_sdp.is_some() {
            self.emit_state(ConnectionState::Connected);
            for (label, open) in log.channels {
                if open {
                    let _ = self.events.send(TransportEvent::DataChannelOpened {
                        wallet: self.remote.clone(),
                        connection_id: self.connection_id.clone(),
                        label,
                    });
                }
            }
        }
    }
}

#[async_trait]
impl RtcSession for ScriptedSession {
    async fn create_offer(&self) -> Result<String, PeerConnectionError> {
        let sdp = format!("offer:{}", self.connection_id);
        self.with_log(|l| l.local_sdp = Some(sdp.clone()))?;
        self.emit_state(ConnectionState::Connecting);
        Ok(sdp)
    }

    async fn create_answer(&self) -> Result<String, PeerConnectionError> {
        let sdp = format!("answer:{}", self.connection_id);
        self.with_log(|l| l.local_sdp = Some(sdp.clone()))?;
        self.emit_state(ConnectionState::Connecting);
        self.maybe_connect();
        Ok(sdp)
    }

    async fn set_remote_offer(&self, sdp: &str) -> Result<(), PeerConnectionError> {
        self.with_log(|l| l.remote_sdp = Some(sdp.to_string()))
    }

    async fn set_remote_answer(&self, sdp: &str) -> Result<(), PeerConnectionError> {
        self.with_log(|l| l.remote_sdp = Some(sdp.to_string()))?;
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerConnectionError> {
        self.with_log(|l| l.candidates.push(candidate))
    }

    async fn create_data_channel(&self, label: &str) -> Result<(), PeerConnectionError> {
        self.with_log(|l| {
            l.channels.insert(label.to_string(), true);
        })
    }

    async fn send_data(&self, label: &str, data: &[u8]) -> Result<usize, PeerConnectionError> {
        self.with_log(|l| {
            if l.channels.get(label) != Some(&true) {
                return Err(PeerConnectionError::WebRtc(format!("channel {label} not open")));
            }
            l.sent.push((label.to_string(), data.to_vec()));
            Ok(data.len())
        })?
    }

    async fn close(&self) -> Result<(), PeerConnectionError> {
        let mut log = self
            .log
            .lock()
            .map_err(|_| PeerConnectionError::WebRtc("session log poisoned".into()))?;
        if log.closed {
            return Ok(());
        }
        for (label, open) in log.channels.iter_mut() {
            if *open {
                *open = false;
                let _ = self.events.send(TransportEvent::DataChannelClosed {
                    wallet: self.remote.clone(),
                    connection_id: self.connection_id.clone(),
                    label: label.clone(),
                });
            }
        }
        log.closed = true;
        Ok(())
    }
}

/// Pub/sub stand-in that keeps everything published so a test can route
/// signaling between managers by hand.
#[derive(Default)]
pub struct SignalOutbox {
    sent: Mutex<Vec<(String, Vec<u8>)>>,
    fail: std::sync::atomic::AtomicBool,
}

impl SignalOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent publish fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Take the signaling messages published so far.
    pub fn drain_signals(&self) -> Vec<SignalMessage> {
        let sent = match self.sent.lock() {
            Ok(mut sent) => std::mem::take(&mut *sent),
            Err(_) => return Vec::new(),
        };
        sent.into_iter()
            .filter_map(|(_, data)| match WireMessage::from_bytes(&data) {
                Ok(WireMessage::Signal(s)) => Some(s),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl PubSubTransport for SignalOutbox {
    async fn subscribe(&self, _topic: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn unsubscribe(&self, _topic: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: "outbox offline".into(),
            });
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((topic.to_string(), data));
        }
        Ok(())
    }
}
