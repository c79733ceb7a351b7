// Peer connections, ICE selection and call state over a pluggable WebRTC stack.

pub mod backend;
pub mod call;
pub mod ice;
pub mod peer;
pub mod scripted;
pub mod webrtc_backend;

mod error;

pub use backend::{IceCandidate, RtcBackend, RtcSession, SessionParams, TransportEvent};
pub use call::{CallEvent, CallInfo, CallManager, CallParticipant, CallState, MediaKind};
pub use error::{CallError, PeerConnectionError};
pub use ice::{CommunityIceServer, IceServer, IceServerKind, IceServerRegistry};
pub use peer::{ConnectionState, PeerConnectionManager, PeerEvent, WebRtcPeerConnection};
pub use webrtc_backend::WebRtcBackend;
