//! One directional link to one remote peer.
//!
//! An outbound session offers local media to a peer; an inbound session
//! answers that peer's offer and receives its media. Candidates that arrive
//! before the remote description is applied are held and flushed exactly once
//! when it lands.

use mesh_proto::{HandshakeId, IceCandidate, PeerId, SessionDescription, SignalPayload};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::media::{LocalTrack, MediaRole};
use crate::transport::{
    ConnectionState, Direction, NegotiationTransport, OfferOptions, SdpKind, SessionKey,
    TrackUpdate, TransportError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    OfferSent,
    OfferReceived,
    Answered,
    Connected,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Still waiting on the first offer/answer exchange.
    pub fn is_negotiating(self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::OfferSent | SessionState::OfferReceived
        )
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("{operation} is not valid on a {direction} session in state {state:?}")]
    InvalidState {
        operation: &'static str,
        direction: Direction,
        state: SessionState,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SessionError {
    /// Transport failures leave the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Transport(_))
    }
}

/// What happened to a remote candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    Buffered,
}

pub struct NegotiationSession {
    key: SessionKey,
    state: SessionState,
    state_since: Instant,
    transport: Box<dyn NegotiationTransport>,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    local_tracks: BTreeMap<MediaRole, LocalTrack>,
    offer_outstanding: Option<Instant>,
    renegotiate_after_answer: bool,
    transport_closed: bool,
}

impl NegotiationSession {
    pub fn new(key: SessionKey, transport: Box<dyn NegotiationTransport>) -> Self {
        Self {
            key,
            state: SessionState::Idle,
            state_since: Instant::now(),
            transport,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            local_tracks: BTreeMap::new(),
            offer_outstanding: None,
            renegotiate_after_answer: false,
            transport_closed: false,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn peer(&self) -> &PeerId {
        &self.key.peer
    }

    pub fn direction(&self) -> Direction {
        self.key.direction
    }

    pub fn handshake_id(&self) -> HandshakeId {
        self.key.handshake_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    pub fn pending_candidates(&self) -> &[IceCandidate] {
        &self.pending_candidates
    }

    pub fn roles(&self) -> Vec<MediaRole> {
        self.local_tracks.keys().copied().collect()
    }

    pub fn has_tracks(&self) -> bool {
        !self.local_tracks.is_empty()
    }

    pub fn is_awaiting_answer(&self) -> bool {
        self.offer_outstanding.is_some()
    }

    /// True when the initial exchange, or an outstanding re-offer, has taken
    /// longer than `timeout`.
    pub fn is_stalled(&self, timeout: Duration, now: Instant) -> bool {
        if self.state.is_negotiating() && now.duration_since(self.state_since) >= timeout {
            return true;
        }
        self.offer_outstanding
            .is_some_and(|sent| now.duration_since(sent) >= timeout)
    }

    /// Attach `tracks` and produce the initial offer. Outbound only, from `Idle`.
    pub async fn start_offer(
        &mut self,
        tracks: &BTreeMap<MediaRole, LocalTrack>,
    ) -> Result<SignalPayload, SessionError> {
        if self.direction() != Direction::Outbound || self.state != SessionState::Idle {
            return Err(self.invalid("start_offer"));
        }
        for (role, track) in tracks {
            self.transport.add_or_replace_track(*role, track).await?;
            self.local_tracks.insert(*role, track.clone());
        }
        let offer = self.send_offer(OfferOptions::default()).await?;
        self.transition(SessionState::OfferSent);
        Ok(offer)
    }

    /// Apply a remote offer and produce the answer. Inbound only.
    ///
    /// An offer on an already answered session is a renegotiation of the same
    /// link and keeps the current state.
    pub async fn accept_offer(&mut self, sdp: &str) -> Result<SignalPayload, SessionError> {
        if self.direction() != Direction::Inbound || self.state.is_terminal() {
            return Err(self.invalid("accept_offer"));
        }
        let initial = self.state == SessionState::Idle;
        if initial {
            self.transition(SessionState::OfferReceived);
        }

        self.transport
            .set_remote_description(SdpKind::Offer, sdp)
            .await?;
        self.remote_description_applied().await?;

        let answer = self.transport.create_answer().await?;
        self.transport
            .set_local_description(SdpKind::Answer, &answer)
            .await?;
        if self.state == SessionState::OfferReceived {
            self.transition(SessionState::Answered);
        }

        Ok(SignalPayload::Answer(SessionDescription {
            sdp: answer,
            handshake_id: self.handshake_id(),
        }))
    }

    /// Apply the remote answer. Outbound only, with an offer outstanding.
    ///
    /// Returns true when track changes arrived while the offer was in flight
    /// and another round is due.
    pub async fn accept_answer(&mut self, sdp: &str) -> Result<bool, SessionError> {
        if self.direction() != Direction::Outbound
            || self.state.is_terminal()
            || self.offer_outstanding.is_none()
        {
            return Err(self.invalid("accept_answer"));
        }
        self.transport
            .set_remote_description(SdpKind::Answer, sdp)
            .await?;
        self.offer_outstanding = None;
        self.remote_description_applied().await?;
        if self.state == SessionState::OfferSent {
            self.transition(SessionState::Answered);
        }
        Ok(std::mem::take(&mut self.renegotiate_after_answer))
    }

    /// Produce a fresh offer on an established outbound session.
    pub async fn renegotiate(&mut self) -> Result<SignalPayload, SessionError> {
        let established = matches!(self.state, SessionState::Answered | SessionState::Connected);
        if self.direction() != Direction::Outbound || !established || self.is_awaiting_answer() {
            return Err(self.invalid("renegotiate"));
        }
        debug!(peer = %self.peer(), handshake = %self.handshake_id(), "renegotiating");
        self.send_offer(OfferOptions::default()).await
    }

    pub async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<CandidateDisposition, SessionError> {
        if self.state.is_terminal() {
            return Err(self.invalid("add_remote_candidate"));
        }
        if self.remote_description_set {
            self.transport.add_ice_candidate(&candidate).await?;
            Ok(CandidateDisposition::Applied)
        } else {
            trace!(peer = %self.peer(), direction = %self.direction(), "buffering early candidate");
            self.pending_candidates.push(candidate);
            Ok(CandidateDisposition::Buffered)
        }
    }

    /// Attach or replace the track for `role`.
    ///
    /// Returns true when the caller should send a new offer now. A change made
    /// while an offer is outstanding is folded into one follow-up round.
    pub async fn set_track(
        &mut self,
        role: MediaRole,
        track: &LocalTrack,
    ) -> Result<bool, SessionError> {
        if self.direction() != Direction::Outbound || self.state.is_terminal() {
            return Err(self.invalid("set_track"));
        }
        if self.local_tracks.get(&role) == Some(track) {
            return Ok(false);
        }
        let update = self.transport.add_or_replace_track(role, track).await?;
        self.local_tracks.insert(role, track.clone());
        Ok(self.needs_offer(update))
    }

    /// Detach the track for `role`, if any. Same return contract as [`Self::set_track`].
    pub async fn drop_track(&mut self, role: MediaRole) -> Result<bool, SessionError> {
        if self.state.is_terminal() || !self.local_tracks.contains_key(&role) {
            return Ok(false);
        }
        let update = self.transport.remove_track(role).await?;
        self.local_tracks.remove(&role);
        Ok(self.needs_offer(update))
    }

    /// Feed a connectivity report from the transport. Returns the new state
    /// when it changed.
    pub fn on_connection_state(&mut self, state: ConnectionState) -> Option<SessionState> {
        let next = match state {
            ConnectionState::Connected if self.state == SessionState::Answered => {
                SessionState::Connected
            }
            ConnectionState::Failed | ConnectionState::Closed if !self.state.is_terminal() => {
                SessionState::Failed
            }
            _ => return None,
        };
        self.transition(next);
        Some(next)
    }

    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.transition(SessionState::Failed);
        }
    }

    /// Release the transport and drop held candidates. Idempotent; a failed
    /// session stays `Failed`.
    pub async fn close(&mut self) {
        if !self.transport_closed {
            self.transport_closed = true;
            if let Err(e) = self.transport.close().await {
                warn!(peer = %self.peer(), direction = %self.direction(), "transport close failed: {}", e);
            }
        }
        self.pending_candidates.clear();
        self.local_tracks.clear();
        self.offer_outstanding = None;
        self.renegotiate_after_answer = false;
        if self.state != SessionState::Failed {
            self.transition(SessionState::Closed);
        }
    }

    fn needs_offer(&mut self, update: TrackUpdate) -> bool {
        if update == TrackUpdate::InPlace {
            return false;
        }
        if self.is_awaiting_answer() {
            self.renegotiate_after_answer = true;
            return false;
        }
        matches!(self.state, SessionState::Answered | SessionState::Connected)
    }

    async fn send_offer(&mut self, options: OfferOptions) -> Result<SignalPayload, SessionError> {
        let sdp = self.transport.create_offer(options).await?;
        self.transport
            .set_local_description(SdpKind::Offer, &sdp)
            .await?;
        self.offer_outstanding = Some(Instant::now());
        Ok(SignalPayload::Offer(SessionDescription {
            sdp,
            handshake_id: self.handshake_id(),
        }))
    }

    async fn remote_description_applied(&mut self) -> Result<(), SessionError> {
        self.remote_description_set = true;
        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            debug!(peer = %self.peer(), count = pending.len(), "flushing buffered candidates");
        }
        for candidate in pending {
            self.transport.add_ice_candidate(&candidate).await?;
        }
        Ok(())
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            trace!(peer = %self.peer(), direction = %self.direction(), from = ?self.state, to = ?next, "session state");
            self.state = next;
            self.state_since = Instant::now();
        }
    }

    fn invalid(&self, operation: &'static str) -> SessionError {
        SessionError::InvalidState {
            operation,
            direction: self.direction(),
            state: self.state,
        }
    }
}
