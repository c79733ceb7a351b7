use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::MAX_MESSAGE_SIZE;
use crate::error::ProtocolError;
use crate::identity::PresenceStatus;
use crate::types::{CallId, Cid, ConversationId, MessageId, WalletAddress};

/// All pub/sub payloads exchanged between peers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum WireMessage {
    /// A new DAG node was pinned; fetch it by CID
    MessageNotice(MessageNotice),

    /// Delivery / read acknowledgement
    Receipt(Receipt),

    /// Ephemeral typing indicator
    Typing(TypingNotice),

    /// Presence heartbeat
    Presence(PresenceNotice),

    /// WebRTC signaling (SDP offer/answer/ICE candidates)
    Signal(SignalMessage),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    File,
    Audio,
    Video,
    System,
    Edit,
    Delete,
}

/// Lightweight pointer to a pinned message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageNotice {
    pub conversation_id: ConversationId,
    pub sender: WalletAddress,
    pub message_id: MessageId,
    pub cid: Cid,
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptKind {
    Delivered,
    Read,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub conversation_id: ConversationId,
    pub sender: WalletAddress,
    pub message_ids: Vec<MessageId>,
    pub status: ReceiptKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub conversation_id: ConversationId,
    pub wallet: WalletAddress,
    pub typing: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceNotice {
    pub wallet: WalletAddress,
    pub status: PresenceStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
    Screen,
}

/// Call metadata riding on an SDP offer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallOffer {
    pub call_id: CallId,
    pub conversation_id: ConversationId,
    pub call_type: CallType,
}

/// WebRTC signaling message for audio/video calls
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    pub sender: WalletAddress,
    pub target: WalletAddress,
    pub connection_id: String,
    pub signal_type: SignalType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalType {
    /// SDP Offer
    Offer {
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call: Option<CallOffer>,
    },
    /// SDP Answer
    Answer { sdp: String },
    /// ICE Candidate
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    },
    /// Call ended
    Hangup,
    /// Anything this version does not understand
    #[serde(other)]
    Unknown,
}

impl WireMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge { size: bytes.len() });
        }
        Ok(bytes)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge { size: data.len() });
        }
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet(c: char) -> WalletAddress {
        WalletAddress::parse(&format!("0x{}", c.to_string().repeat(40))).unwrap()
    }

    #[test]
    fn test_notice_roundtrip() {
        let msg = WireMessage::MessageNotice(MessageNotice {
            conversation_id: ConversationId::random(),
            sender: wallet('a'),
            message_id: MessageId::new(),
            cid: Cid::for_bytes(b"node"),
            message_type: MessageType::Text,
            timestamp: Utc::now(),
        });

        let bytes = msg.to_bytes().unwrap();
        assert_eq!(WireMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_signal_type_tagging() {
        let signal = SignalType::IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["type"], "ice-candidate");
        assert_eq!(json["sdpMlineIndex"], 0);
    }

    #[test]
    fn test_unknown_signal_type_parses() {
        let raw = serde_json::json!({
            "kind": "signal",
            "sender": wallet('a'),
            "target": wallet('b'),
            "connectionId": "c1",
            "signalType": { "type": "renegotiate" }
        });
        let msg = WireMessage::from_bytes(raw.to_string().as_bytes()).unwrap();
        match msg {
            WireMessage::Signal(s) => assert_eq!(s.signal_type, SignalType::Unknown),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_oversized_rejected() {
        let data = vec![b' '; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(
            WireMessage::from_bytes(&data),
            Err(ProtocolError::TooLarge { .. })
        ));
    }
}
