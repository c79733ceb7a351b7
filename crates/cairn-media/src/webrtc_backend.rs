//! [`RtcBackend`] over the `webrtc` crate.
//!
//! Each session is one `RTCPeerConnection`. Callbacks registered on the
//! connection and its data channels are forwarded as [`TransportEvent`]s.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use cairn_shared::types::WalletAddress;

use crate::backend::{IceCandidate, RtcBackend, RtcSession, SessionParams, TransportEvent};
use crate::error::PeerConnectionError;
use crate::peer::ConnectionState;

pub struct WebRtcBackend {
    api: API,
}

impl WebRtcBackend {
    pub fn new() -> Result<Self, PeerConnectionError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl RtcBackend for WebRtcBackend {
    async fn create_session(
        &self,
        params: SessionParams,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn RtcSession>, PeerConnectionError> {
        let config = RTCConfiguration {
            ice_servers: params
                .ice_servers
                .into_iter()
                .map(|s| RTCIceServer {
                    urls: s.urls,
                    username: s.username.unwrap_or_default(),
                    credential: s.credential.unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);

        let session = Arc::new(WebRtcSession {
            pc,
            channels: Arc::new(Mutex::new(HashMap::new())),
            sink: EventSink {
                wallet: params.remote,
                connection_id: params.connection_id,
                tx: events,
            },
        });
        session.install_handlers();
        debug!(peer = %session.sink.wallet.short(), connection = %session.sink.connection_id, "peer connection created");
        Ok(session)
    }
}

/// Tags callbacks with the connection they belong to.
#[derive(Clone)]
struct EventSink {
    wallet: WalletAddress,
    connection_id: String,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    fn state(&self, state: ConnectionState) {
        let _ = self.tx.send(TransportEvent::StateChanged {
            wallet: self.wallet.clone(),
            connection_id: self.connection_id.clone(),
            state,
        });
    }

    fn candidate(&self, candidate: IceCandidate) {
        let _ = self.tx.send(TransportEvent::LocalCandidate {
            wallet: self.wallet.clone(),
            connection_id: self.connection_id.clone(),
            candidate,
        });
    }

    fn channel(&self, label: String, open: bool) {
        let (wallet, connection_id) = (self.wallet.clone(), self.connection_id.clone());
        let _ = self.tx.send(if open {
            TransportEvent::DataChannelOpened {
                wallet,
                connection_id,
                label,
            }
        } else {
            TransportEvent::DataChannelClosed {
                wallet,
                connection_id,
                label,
            }
        });
    }

    fn received(&self, label: String, bytes: usize) {
        let _ = self.tx.send(TransportEvent::Received {
            wallet: self.wallet.clone(),
            connection_id: self.connection_id.clone(),
            label,
            bytes,
        });
    }
}

type Channels = Arc<Mutex<HashMap<String, Arc<RTCDataChannel>>>>;

pub struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
    channels: Channels,
    sink: EventSink,
}

fn map_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

impl WebRtcSession {
    fn install_handlers(&self) {
        let sink = self.sink.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                sink.state(map_state(s));
                Box::pin(async {})
            }));

        let sink = self.sink.clone();
        self.pc
            .on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
                if let Some(c) = c {
                    match c.to_json() {
                        Ok(init) => sink.candidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }),
                        Err(e) => debug!(error = %e, "unserializable local candidate"),
                    }
                }
                Box::pin(async {})
            }));

        // Channels the remote side opened
        let sink = self.sink.clone();
        let channels = self.channels.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let sink = sink.clone();
                let channels = channels.clone();
                Box::pin(async move {
                    wire_channel(&sink, &dc);
                    channels.lock().await.insert(dc.label().to_string(), dc);
                })
            }));
    }
}

fn wire_channel(sink: &EventSink, dc: &Arc<RTCDataChannel>) {
    let label = dc.label().to_string();

    let (s, l) = (sink.clone(), label.clone());
    dc.on_open(Box::new(move || {
        s.channel(l.clone(), true);
        Box::pin(async {})
    }));

    let (s, l) = (sink.clone(), label.clone());
    dc.on_close(Box::new(move || {
        s.channel(l.clone(), false);
        Box::pin(async {})
    }));

    let (s, l) = (sink.clone(), label);
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        s.received(l.clone(), msg.data.len());
        Box::pin(async {})
    }));
}

#[async_trait]
impl RtcSession for WebRtcSession {
    async fn create_offer(&self) -> Result<String, PeerConnectionError> {
        let offer = self.pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await?;
        Ok(sdp)
    }

    async fn create_answer(&self) -> Result<String, PeerConnectionError> {
        let answer = self.pc.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await?;
        Ok(sdp)
    }

    async fn set_remote_offer(&self, sdp: &str) -> Result<(), PeerConnectionError> {
        let desc = RTCSessionDescription::offer(sdp.to_string())?;
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn set_remote_answer(&self, sdp: &str) -> Result<(), PeerConnectionError> {
        let desc = RTCSessionDescription::answer(sdp.to_string())?;
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerConnectionError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<(), PeerConnectionError> {
        let dc = self.pc.create_data_channel(label, None).await?;
        wire_channel(&self.sink, &dc);
        self.channels.lock().await.insert(label.to_string(), dc);
        Ok(())
    }

    async fn send_data(&self, label: &str, data: &[u8]) -> Result<usize, PeerConnectionError> {
        let dc = self
            .channels
            .lock()
            .await
            .get(label)
            .cloned()
            .ok_or_else(|| PeerConnectionError::WebRtc(format!("no data channel {label}")))?;
        Ok(dc.send(&Bytes::copy_from_slice(data)).await?)
    }

    async fn close(&self) -> Result<(), PeerConnectionError> {
        let channels: Vec<Arc<RTCDataChannel>> =
            self.channels.lock().await.drain().map(|(_, dc)| dc).collect();
        for dc in channels {
            if let Err(e) = dc.close().await {
                warn!(label = dc.label(), error = %e, "data channel close failed");
            }
        }
        self.pc.close().await?;
        Ok(())
    }
}
