//! Wire types shared by the mesh relay (`mesh-road`) and its peers.
//!
//! Frames are JSON over a websocket. Frame envelopes are internally tagged with
//! `"type"`; negotiation payloads use exactly one key (`offer`, `answer`,
//! `inCandidate`, `outCandidate`) and travel through the relay as opaque JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Identifier the relay assigns to a connected peer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Allocate a fresh identifier. UUID v4, so never reused while another peer is live.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifies one outbound session instance; both ends of a link share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandshakeId(Uuid);

impl HandshakeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HandshakeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandshakeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Roster snapshot broadcast by the relay after every membership change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    pub peers: BTreeSet<PeerId>,
    pub version: u64,
}

impl PresenceState {
    pub fn new(peers: impl IntoIterator<Item = PeerId>, version: u64) -> Self {
        Self {
            peers: peers.into_iter().collect(),
            version,
        }
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains(peer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    pub handshake_id: HandshakeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSignal {
    #[serde(flatten)]
    pub candidate: IceCandidate,
    pub handshake_id: HandshakeId,
}

/// Negotiation payload carried between two peers.
///
/// `InCandidate` targets the recipient's inbound session for the sender,
/// `OutCandidate` the recipient's outbound session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignalPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    InCandidate(CandidateSignal),
    OutCandidate(CandidateSignal),
}

impl SignalPayload {
    pub fn handshake_id(&self) -> HandshakeId {
        match self {
            SignalPayload::Offer(desc) | SignalPayload::Answer(desc) => desc.handshake_id,
            SignalPayload::InCandidate(signal) | SignalPayload::OutCandidate(signal) => {
                signal.handshake_id
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer(_) => "offer",
            SignalPayload::Answer(_) => "answer",
            SignalPayload::InCandidate(_) => "in_candidate",
            SignalPayload::OutCandidate(_) => "out_candidate",
        }
    }

    pub fn to_value(&self) -> Result<Value, ProtoError> {
        serde_json::to_value(self).map_err(ProtoError::Encode)
    }

    pub fn from_value(value: &Value) -> Result<Self, ProtoError> {
        Self::deserialize(value).map_err(ProtoError::MalformedPayload)
    }
}

/// Frames sent from a peer to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Forward `msg` to `to`. The relay never looks inside `msg`.
    #[serde(rename = "webrtc")]
    Webrtc { to: PeerId, msg: Value },
    /// Heartbeat to keep the membership alive.
    Ping,
}

impl ClientMessage {
    pub fn signal(to: PeerId, payload: &SignalPayload) -> Result<Self, ProtoError> {
        Ok(ClientMessage::Webrtc {
            to,
            msg: payload.to_value()?,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, ProtoError> {
        serde_json::from_str(text).map_err(ProtoError::InvalidFrame)
    }
}

/// Frames sent from the relay to a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First frame on every connection: the identifier assigned to this peer.
    Welcome { peer_id: PeerId },
    /// Full roster, sent after every join or leave.
    Update { peers: Vec<PeerId>, version: u64 },
    /// Envelope relayed from `from`, stamped by the relay.
    #[serde(rename = "webrtc")]
    Webrtc { from: PeerId, msg: Value },
    Pong,
    Error { message: String },
}

impl ServerMessage {
    pub fn update(state: &PresenceState) -> Self {
        ServerMessage::Update {
            peers: state.peers.iter().cloned().collect(),
            version: state.version,
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ProtoError> {
        serde_json::from_str(text).map_err(ProtoError::InvalidFrame)
    }
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("malformed negotiation payload: {0}")]
    MalformedPayload(#[source] serde_json::Error),
    #[error("invalid frame: {0}")]
    InvalidFrame(#[source] serde_json::Error),
    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn offer(sdp: &str) -> SignalPayload {
        SignalPayload::Offer(SessionDescription {
            sdp: sdp.to_string(),
            handshake_id: HandshakeId::new(),
        })
    }

    #[test_timeout::timeout]
    fn payload_encodes_exactly_one_key() {
        let value = offer("v=0").to_value().unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 1);
        assert_eq!(object["offer"]["sdp"], "v=0");

        let candidate = SignalPayload::InCandidate(CandidateSignal {
            candidate: IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host"),
            handshake_id: HandshakeId::new(),
        });
        let value = candidate.to_value().unwrap();
        assert!(value.get("inCandidate").is_some());
        assert!(value["inCandidate"].get("sdp_mid").is_none());
    }

    #[test_timeout::timeout]
    fn payload_with_two_keys_is_malformed() {
        let handshake = HandshakeId::new();
        let value = json!({
            "offer": { "sdp": "a", "handshake_id": handshake },
            "answer": { "sdp": "b", "handshake_id": handshake },
        });
        assert!(matches!(
            SignalPayload::from_value(&value),
            Err(ProtoError::MalformedPayload(_))
        ));
    }

    #[test_timeout::timeout]
    fn unknown_or_empty_payload_is_malformed() {
        assert!(SignalPayload::from_value(&json!({})).is_err());
        assert!(SignalPayload::from_value(&json!({ "bye": {} })).is_err());
        assert!(SignalPayload::from_value(&json!("offer")).is_err());
    }

    #[test_timeout::timeout]
    fn client_frame_wire_shape() {
        let payload = offer("v=0");
        let frame = ClientMessage::signal(PeerId::from("bob"), &payload).unwrap();
        let text = serde_json::to_string(&frame).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "webrtc");
        assert_eq!(value["to"], "bob");
        assert_eq!(SignalPayload::from_value(&value["msg"]).unwrap(), payload);

        let ping = ClientMessage::from_json(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(ping, ClientMessage::Ping));
    }

    #[test_timeout::timeout]
    fn update_lists_peers_in_order() {
        let state = PresenceState::new([PeerId::from("b"), PeerId::from("a")], 7);
        let text = serde_json::to_string(&ServerMessage::update(&state)).unwrap();
        assert_eq!(text, r#"{"type":"update","peers":["a","b"],"version":7}"#);
    }

    #[test_timeout::timeout]
    fn generated_peer_ids_are_unique() {
        assert_ne!(PeerId::generate(), PeerId::generate());
        assert_ne!(HandshakeId::new(), HandshakeId::new());
    }
}
