use thiserror::Error;

use cairn_shared::types::CallId;

use crate::call::CallState;
use crate::peer::ConnectionState;

#[derive(Error, Debug)]
pub enum PeerConnectionError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Illegal connection transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("Signaling failed: {0}")]
    Signaling(String),
}

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Call not found: {0}")]
    NotFound(CallId),

    #[error("Illegal call transition {from:?} -> {to:?}")]
    InvalidTransition { from: CallState, to: CallState },

    #[error("Call has no remote participants")]
    NoParticipants,

    #[error(transparent)]
    Peer(#[from] PeerConnectionError),

    #[error("Call archive failed: {0}")]
    Store(#[from] cairn_store::StoreError),
}

impl From<webrtc::Error> for PeerConnectionError {
    fn from(e: webrtc::Error) -> Self {
        PeerConnectionError::WebRtc(e.to_string())
    }
}
