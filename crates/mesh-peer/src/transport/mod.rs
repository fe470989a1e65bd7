//! The seam between negotiation logic and the real-time media stack.
//!
//! Sessions drive a [`NegotiationTransport`] and never touch the media engine
//! directly. Transports report asynchronous happenings through
//! [`TransportEvents`], which tags every event with the session instance that
//! produced it so late events from a replaced session can be recognised.

pub mod mock;
pub mod webrtc;

use async_trait::async_trait;
use mesh_proto::{HandshakeId, IceCandidate, PeerId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::{LocalTrack, MediaRole};
use crate::orchestrator::OrchestratorEvent;

/// Which way media flows on a link, seen from the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Remote peer's media arriving here
    Inbound,
    /// Local media going to the remote peer
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

/// Names one session instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SessionKey {
    pub peer: PeerId,
    pub direction: Direction,
    pub handshake_id: HandshakeId,
}

impl SessionKey {
    pub fn new(peer: PeerId, direction: Direction, handshake_id: HandshakeId) -> Self {
        Self {
            peer,
            direction,
            handshake_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OfferOptions {
    pub ice_restart: bool,
}

/// Whether a track change can ride on the current negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackUpdate {
    /// Swapped on an existing sender; no new offer needed
    InPlace,
    /// The media sections changed; a fresh offer/answer round is required
    RenegotiationRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A local candidate to ship to the remote end; `None` ends gathering
    IceCandidate(Option<IceCandidate>),
    /// Remote media arrived
    Track { role: MediaRole, track_id: String },
    ConnectionState(ConnectionState),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("media track error: {0}")]
    Track(String),

    #[error("transport closed")]
    Closed,
}

/// The negotiation surface of a peer connection.
#[async_trait]
pub trait NegotiationTransport: Send + Sync {
    async fn create_offer(&self, options: OfferOptions) -> Result<String, TransportError>;

    async fn create_answer(&self) -> Result<String, TransportError>;

    async fn set_local_description(&self, kind: SdpKind, sdp: &str) -> Result<(), TransportError>;

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str)
        -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError>;

    async fn add_or_replace_track(
        &self,
        role: MediaRole,
        track: &LocalTrack,
    ) -> Result<TrackUpdate, TransportError>;

    async fn remove_track(&self, role: MediaRole) -> Result<TrackUpdate, TransportError>;

    /// Release the connection. Safe to call more than once.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Builds one transport per session instance.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        key: &SessionKey,
        events: TransportEvents,
    ) -> Result<Box<dyn NegotiationTransport>, TransportError>;

    /// Called once no session publishes `track` any more.
    fn release_track(&self, _track: &LocalTrack) {}
}

/// Event sink handed to a transport at creation.
#[derive(Clone, Debug)]
pub struct TransportEvents {
    key: SessionKey,
    tx: mpsc::UnboundedSender<OrchestratorEvent>,
}

impl TransportEvents {
    pub(crate) fn new(key: SessionKey, tx: mpsc::UnboundedSender<OrchestratorEvent>) -> Self {
        Self { key, tx }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Queue an event for the orchestrator. Dropped once it has shut down.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(OrchestratorEvent::Transport {
            key: self.key.clone(),
            event,
        });
    }
}
