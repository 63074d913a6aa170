//! Signaling envelope exchanged between agents and the hub.
//!
//! Every message is a JSON object `{type, peerId?, targetId?, payload?}`.
//! Several envelopes may share one transport frame, separated by `\n`.
//! The payload is kept as raw JSON so the hub can relay it untouched.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::ProtocolError;
use crate::types::{FileDescriptor, PeerInfo};

/// Envelope `type` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Join,
    Peers,
    PeerJoined,
    PeerLeft,
    CreateRoom,
    RoomCreated,
    JoinRoom,
    RoomJoined,
    LeaveRoom,
    RoomLeft,
    RoomError,
    Offer,
    Answer,
    IceCandidate,
    TransferRequest,
    TransferResponse,
    RelayChunk,
    Ping,
    Pong,
    /// Any tag this build doesn't know about
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Whether the hub forwards this message to a single target session.
    pub fn is_relayed(self) -> bool {
        matches!(
            self,
            MessageType::Offer
                | MessageType::Answer
                | MessageType::IceCandidate
                | MessageType::TransferRequest
                | MessageType::TransferResponse
                | MessageType::RelayChunk
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Sender id, stamped by the hub on relayed messages
    #[serde(rename = "peerId", default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    #[serde(rename = "targetId", default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
}

impl Envelope {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            peer_id: None,
            target_id: None,
            payload: None,
        }
    }

    /// Build an envelope carrying `payload`.
    pub fn with_payload<T: Serialize>(kind: MessageType, payload: &T) -> Result<Self, ProtocolError> {
        let raw = serde_json::value::to_raw_value(payload)?;
        Ok(Self {
            payload: Some(raw),
            ..Self::new(kind)
        })
    }

    /// Address this envelope to `target`.
    pub fn to(mut self, target: impl Into<String>) -> Self {
        self.target_id = Some(target.into());
        self
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Split a transport frame into its newline-delimited envelopes.
    /// Blank lines are skipped; each line decodes independently.
    pub fn decode_batch(text: &str) -> impl Iterator<Item = Result<Self, ProtocolError>> + '_ {
        text.split('\n')
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(Self::decode)
    }

    /// Decode the payload as `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let raw = self
            .payload
            .as_ref()
            .ok_or(ProtocolError::MissingPayload(self.kind))?;
        Ok(serde_json::from_str(raw.get())?)
    }

    pub fn pong() -> Self {
        Self::new(MessageType::Pong)
    }

    pub fn peers(peers: Vec<PeerInfo>) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::Peers, &PeersPayload { peers })
    }

    pub fn peer_joined(peer: PeerInfo) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::PeerJoined, &PeerJoinedPayload { peer })
    }

    pub fn peer_left(peer_id: impl Into<String>) -> Result<Self, ProtocolError> {
        Self::with_payload(
            MessageType::PeerLeft,
            &PeerLeftPayload {
                peer_id: peer_id.into(),
            },
        )
    }

    pub fn room_created(code: impl Into<String>) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::RoomCreated, &RoomCodePayload { code: code.into() })
    }

    pub fn room_joined(code: impl Into<String>, peers: Vec<PeerInfo>) -> Result<Self, ProtocolError> {
        Self::with_payload(
            MessageType::RoomJoined,
            &RoomJoinedPayload {
                code: code.into(),
                peers,
            },
        )
    }

    pub fn room_left(code: impl Into<String>) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::RoomLeft, &RoomCodePayload { code: code.into() })
    }

    pub fn room_error(error: impl Into<String>) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::RoomError, &RoomErrorPayload { error: error.into() })
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPayload {
    pub name: String,
    pub platform: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeersPayload {
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerJoinedPayload {
    pub peer: PeerInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerLeftPayload {
    #[serde(rename = "peerId")]
    pub peer_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomCodePayload {
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomJoinedPayload {
    pub code: String,
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomErrorPayload {
    pub error: String,
}

/// SDP offer or answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpPayload {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequestPayload {
    pub transfer_id: String,
    pub files: Vec<FileDescriptor>,
    pub total_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResponsePayload {
    pub transfer_id: String,
    pub accepted: bool,
}

/// One chunk on the relay path. `data` is base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayChunkPayload {
    pub transfer_id: String,
    pub file_index: u32,
    pub chunk_index: u32,
    pub data: String,
    pub is_last: bool,
}
