//! Seam between the connection state machine and a concrete WebRTC stack.
//!
//! Backends report asynchronous callbacks (state changes, gathered ICE
//! candidates, data channel lifecycle) as [`TransportEvent`]s on the channel
//! handed to [`RtcBackend::create_session`]. Every event carries the
//! connection id so events from a replaced connection can be discarded.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use cairn_shared::types::WalletAddress;

use crate::error::PeerConnectionError;
use crate::ice::IceServer;
use crate::peer::ConnectionState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged {
        wallet: WalletAddress,
        connection_id: String,
        state: ConnectionState,
    },
    LocalCandidate {
        wallet: WalletAddress,
        connection_id: String,
        candidate: IceCandidate,
    },
    DataChannelOpened {
        wallet: WalletAddress,
        connection_id: String,
        label: String,
    },
    DataChannelClosed {
        wallet: WalletAddress,
        connection_id: String,
        label: String,
    },
    /// Bytes received on a data channel
    Received {
        wallet: WalletAddress,
        connection_id: String,
        label: String,
        bytes: usize,
    },
}

impl TransportEvent {
    pub fn wallet(&self) -> &WalletAddress {
        match self {
            TransportEvent::StateChanged { wallet, .. }
            | TransportEvent::LocalCandidate { wallet, .. }
            | TransportEvent::DataChannelOpened { wallet, .. }
            | TransportEvent::DataChannelClosed { wallet, .. }
            | TransportEvent::Received { wallet, .. } => wallet,
        }
    }

    pub fn connection_id(&self) -> &str {
        match self {
            TransportEvent::StateChanged { connection_id, .. }
            | TransportEvent::LocalCandidate { connection_id, .. }
            | TransportEvent::DataChannelOpened { connection_id, .. }
            | TransportEvent::DataChannelClosed { connection_id, .. }
            | TransportEvent::Received { connection_id, .. } => connection_id,
        }
    }
}

/// Parameters for a new session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub remote: WalletAddress,
    pub connection_id: String,
    pub ice_servers: Vec<IceServer>,
}

#[async_trait]
pub trait RtcBackend: Send + Sync {
    async fn create_session(
        &self,
        params: SessionParams,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn RtcSession>, PeerConnectionError>;
}

/// One underlying peer connection.
#[async_trait]
pub trait RtcSession: Send + Sync {
    /// Create an offer and install it as the local description.
    async fn create_offer(&self) -> Result<String, PeerConnectionError>;

    /// Create an answer to the installed remote offer and install it locally.
    async fn create_answer(&self) -> Result<String, PeerConnectionError>;

    async fn set_remote_offer(&self, sdp: &str) -> Result<(), PeerConnectionError>;

    async fn set_remote_answer(&self, sdp: &str) -> Result<(), PeerConnectionError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerConnectionError>;

    async fn create_data_channel(&self, label: &str) -> Result<(), PeerConnectionError>;

    /// Send on an open data channel; returns the number of bytes written.
    async fn send_data(&self, label: &str, data: &[u8]) -> Result<usize, PeerConnectionError>;

    /// Close every data channel, then the connection itself. Returns only
    /// after the channels are closed.
    async fn close(&self) -> Result<(), PeerConnectionError>;
}
