//! Keeps one node's set of sessions consistent with the roster and its local
//! media.
//!
//! Everything that can change session state (roster updates, relayed
//! envelopes, transport callbacks, media requests) is funnelled through one
//! event queue and handled by a single task, one event at a time. Transport
//! calls are awaited inside that task, so no other event can observe a
//! half-applied change.

use mesh_proto::{
    CandidateSignal, ClientMessage, HandshakeId, IceCandidate, PeerId, PresenceState, ServerMessage,
    SessionDescription, SignalPayload,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::config::PeerConfig;
use crate::error::{PeerError, SignalError};
use crate::media::{LocalTrack, MediaRole};
use crate::session::{NegotiationSession, SessionError, SessionState};
use crate::transport::{
    Direction, SessionKey, TransportError, TransportEvent, TransportEvents, TransportFactory,
};

const MIN_MAINTENANCE_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub enum OrchestratorEvent {
    /// The relay assigned our id
    Welcome(PeerId),
    /// Roster broadcast
    Presence(PresenceState),
    /// Negotiation payload relayed from another peer
    Signal { from: PeerId, msg: Value },
    /// The relay connection dropped; every peer is gone with it
    RelayLost,
    Transport {
        key: SessionKey,
        event: TransportEvent,
    },
    StartMedia {
        role: MediaRole,
        track: LocalTrack,
    },
    StopMedia {
        role: MediaRole,
    },
    Snapshot {
        reply: oneshot::Sender<OrchestratorSnapshot>,
    },
    Shutdown,
}

impl OrchestratorEvent {
    /// Map a relay frame onto the queue. Keep-alive and error frames carry
    /// nothing for the orchestrator.
    pub fn from_server(message: ServerMessage) -> Option<Self> {
        match message {
            ServerMessage::Welcome { peer_id } => Some(Self::Welcome(peer_id)),
            ServerMessage::Update { peers, version } => {
                Some(Self::Presence(PresenceState::new(peers, version)))
            }
            ServerMessage::Webrtc { from, msg } => Some(Self::Signal { from, msg }),
            ServerMessage::Pong => None,
            ServerMessage::Error { message } => {
                warn!("relay rejected a frame: {}", message);
                None
            }
        }
    }
}

/// Reported to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerNotification {
    RemoteTrack {
        peer: PeerId,
        role: MediaRole,
        track_id: String,
    },
    SessionStateChanged {
        peer: PeerId,
        direction: Direction,
        state: SessionState,
    },
    PeerReleased {
        peer: PeerId,
    },
    /// The relay connection ended; every peer has been released and the
    /// node stays idle until it joins again.
    RelayLost,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub peer: PeerId,
    pub direction: Direction,
    pub handshake_id: HandshakeId,
    pub state: SessionState,
    pub roles: Vec<MediaRole>,
    pub pending_candidates: usize,
}

impl SessionSnapshot {
    fn of(session: &NegotiationSession) -> Self {
        Self {
            peer: session.peer().clone(),
            direction: session.direction(),
            handshake_id: session.handshake_id(),
            state: session.state(),
            roles: session.roles(),
            pending_candidates: session.pending_candidates().len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrchestratorSnapshot {
    pub local_id: Option<PeerId>,
    pub known_peers: Vec<PeerId>,
    pub roster_version: Option<u64>,
    pub local_media: Vec<MediaRole>,
    pub sessions: Vec<SessionSnapshot>,
}

impl OrchestratorSnapshot {
    pub fn session(&self, peer: &PeerId, direction: Direction) -> Option<&SessionSnapshot> {
        self.sessions
            .iter()
            .find(|s| &s.peer == peer && s.direction == direction)
    }
}

/// Cloneable entry point into a running [`Orchestrator`].
#[derive(Clone, Debug)]
pub struct OrchestratorHandle {
    events: mpsc::UnboundedSender<OrchestratorEvent>,
}

impl OrchestratorHandle {
    pub fn deliver(&self, event: OrchestratorEvent) -> Result<(), PeerError> {
        self.events.send(event).map_err(|_| PeerError::Stopped)
    }

    /// Publish `track` as the local `role` to every peer. Repeating a call is a no-op.
    pub fn start_media(&self, role: MediaRole, track: LocalTrack) -> Result<(), PeerError> {
        self.deliver(OrchestratorEvent::StartMedia { role, track })
    }

    pub fn stop_media(&self, role: MediaRole) -> Result<(), PeerError> {
        self.deliver(OrchestratorEvent::StopMedia { role })
    }

    pub async fn snapshot(&self) -> Result<OrchestratorSnapshot, PeerError> {
        let (reply, rx) = oneshot::channel();
        self.deliver(OrchestratorEvent::Snapshot { reply })?;
        rx.await.map_err(|_| PeerError::Stopped)
    }

    /// Close every session and stop the orchestrator task.
    pub fn shutdown(&self) {
        let _ = self.events.send(OrchestratorEvent::Shutdown);
    }
}

pub struct Orchestrator {
    local_id: Option<PeerId>,
    known_peers: BTreeSet<PeerId>,
    roster_version: Option<u64>,
    local_media: BTreeMap<MediaRole, LocalTrack>,
    outbound: BTreeMap<PeerId, NegotiationSession>,
    inbound: BTreeMap<PeerId, NegotiationSession>,
    /// Candidates for an inbound handshake whose offer has not arrived while
    /// an older inbound session is still live
    held_candidates: BTreeMap<PeerId, Vec<(HandshakeId, IceCandidate)>>,
    factory: Arc<dyn TransportFactory>,
    negotiation_timeout: Option<Duration>,
    maintenance_interval: Duration,
    events_tx: mpsc::UnboundedSender<OrchestratorEvent>,
    events_rx: mpsc::UnboundedReceiver<OrchestratorEvent>,
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    notifications: mpsc::UnboundedSender<PeerNotification>,
}

impl Orchestrator {
    /// Frames for the relay are written to `outgoing`.
    pub fn new(
        config: &PeerConfig,
        factory: Arc<dyn TransportFactory>,
        outgoing: mpsc::UnboundedSender<ClientMessage>,
    ) -> (Self, OrchestratorHandle, mpsc::UnboundedReceiver<PeerNotification>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notifications, notifications_rx) = mpsc::unbounded_channel();
        let handle = OrchestratorHandle {
            events: events_tx.clone(),
        };
        let orchestrator = Self {
            local_id: None,
            known_peers: BTreeSet::new(),
            roster_version: None,
            local_media: BTreeMap::new(),
            outbound: BTreeMap::new(),
            inbound: BTreeMap::new(),
            held_candidates: BTreeMap::new(),
            factory,
            negotiation_timeout: config.negotiation_timeout,
            maintenance_interval: config.maintenance_interval,
            events_tx,
            events_rx,
            outgoing,
            notifications,
        };
        (orchestrator, handle, notifications_rx)
    }

    /// Process events until [`OrchestratorHandle::shutdown`], then close every session.
    pub async fn run(mut self) {
        let mut maintenance =
            tokio::time::interval(self.maintenance_interval.max(MIN_MAINTENANCE_INTERVAL));
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(OrchestratorEvent::Shutdown) | None => break,
                    Some(event) => self.handle(event).await,
                },
                _ = maintenance.tick() => self.maintain(Instant::now()).await,
            }
        }

        self.close_all().await;
        debug!("orchestrator stopped");
    }

    pub async fn handle(&mut self, event: OrchestratorEvent) {
        match event {
            OrchestratorEvent::Welcome(peer_id) => self.on_welcome(peer_id).await,
            OrchestratorEvent::Presence(state) => self.apply_presence(state).await,
            OrchestratorEvent::Signal { from, msg } => {
                if let Err(e) = self.dispatch_signal(&from, &msg).await {
                    report_dropped(&from, &e);
                }
            }
            OrchestratorEvent::RelayLost => self.on_relay_lost().await,
            OrchestratorEvent::Transport { key, event } => {
                self.on_transport_event(key, event).await
            }
            OrchestratorEvent::StartMedia { role, track } => self.start_media(role, track).await,
            OrchestratorEvent::StopMedia { role } => self.stop_media(role).await,
            OrchestratorEvent::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            OrchestratorEvent::Shutdown => self.close_all().await,
        }
    }

    /// Handle everything queued so far, including events raised while doing so.
    pub async fn process_pending(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle(event).await;
        }
    }

    /// Periodic pass: fail sessions stuck in negotiation, then re-attempt
    /// any outbound link that should exist but does not.
    pub async fn maintain(&mut self, now: Instant) {
        if let Some(timeout) = self.negotiation_timeout {
            let stalled: Vec<(Direction, PeerId)> = self
                .outbound
                .iter()
                .chain(self.inbound.iter())
                .filter(|(_, session)| session.is_stalled(timeout, now))
                .map(|(peer, session)| (session.direction(), peer.clone()))
                .collect();
            for (direction, peer) in stalled {
                warn!(peer = %peer, %direction, "negotiation timed out");
                self.fail_session(direction, &peer).await;
            }
        }
        self.establish_missing().await;
    }

    pub fn snapshot(&self) -> OrchestratorSnapshot {
        OrchestratorSnapshot {
            local_id: self.local_id.clone(),
            known_peers: self.known_peers.iter().cloned().collect(),
            roster_version: self.roster_version,
            local_media: self.local_media.keys().copied().collect(),
            sessions: self
                .outbound
                .values()
                .chain(self.inbound.values())
                .map(SessionSnapshot::of)
                .collect(),
        }
    }

    async fn on_welcome(&mut self, peer_id: PeerId) {
        info!(peer_id = %peer_id, "joined mesh");
        self.local_id = Some(peer_id);
        self.establish_missing().await;
    }

    /// Reconcile against a roster broadcast: release departed peers, adopt the
    /// new set, then open whatever outbound links are missing.
    async fn apply_presence(&mut self, state: PresenceState) {
        if let Some(last) = self.roster_version {
            if state.version <= last {
                debug!(version = state.version, last, "ignoring stale roster");
                return;
            }
        }
        let PresenceState { peers, version } = state;

        let departed: BTreeSet<PeerId> = self
            .known_peers
            .iter()
            .chain(self.outbound.keys())
            .chain(self.inbound.keys())
            .filter(|peer| !peers.contains(*peer) && Some(*peer) != self.local_id.as_ref())
            .cloned()
            .collect();
        for peer in &departed {
            self.release_peer(peer).await;
        }

        debug!(version, peers = peers.len(), "roster applied");
        self.known_peers = peers;
        self.roster_version = Some(version);
        self.establish_missing().await;
    }

    async fn on_relay_lost(&mut self) {
        warn!("relay connection lost; releasing every peer");
        let peers: BTreeSet<PeerId> = self
            .known_peers
            .iter()
            .chain(self.outbound.keys())
            .chain(self.inbound.keys())
            .filter(|peer| Some(*peer) != self.local_id.as_ref())
            .cloned()
            .collect();
        for peer in &peers {
            self.release_peer(peer).await;
        }
        self.held_candidates.clear();
        self.known_peers.clear();
        self.roster_version = None;
        self.local_id = None;
        let _ = self.notifications.send(PeerNotification::RelayLost);
    }

    async fn release_peer(&mut self, peer: &PeerId) {
        self.close_session(Direction::Outbound, peer).await;
        self.close_session(Direction::Inbound, peer).await;
        self.held_candidates.remove(peer);
        info!(peer = %peer, "peer left the mesh");
        let _ = self
            .notifications
            .send(PeerNotification::PeerReleased { peer: peer.clone() });
    }

    async fn establish_missing(&mut self) {
        if self.local_media.is_empty() {
            return;
        }
        let Some(local_id) = self.local_id.clone() else {
            return;
        };
        let targets: Vec<PeerId> = self
            .known_peers
            .iter()
            .filter(|peer| **peer != local_id && !self.outbound.contains_key(*peer))
            .cloned()
            .collect();
        for peer in targets {
            self.open_outbound(peer).await;
        }
    }

    async fn open_outbound(&mut self, peer: PeerId) {
        let key = SessionKey::new(peer.clone(), Direction::Outbound, HandshakeId::new());
        let mut session = match self.new_session(key).await {
            Ok(session) => session,
            Err(e) => {
                warn!(peer = %peer, "failed to create outbound transport: {}", e);
                return;
            }
        };

        match session.start_offer(&self.local_media).await {
            Ok(offer) => {
                debug!(peer = %peer, handshake = %session.handshake_id(), "offering local media");
                send_signal(&self.outgoing, &peer, &offer);
                announce(&self.notifications, &session, SessionState::Idle);
                self.outbound.insert(peer, session);
            }
            Err(e) => {
                warn!(peer = %peer, "failed to start outbound session: {}", e);
                session.fail();
                session.close().await;
                announce(&self.notifications, &session, SessionState::Idle);
            }
        }
    }

    async fn new_session(&self, key: SessionKey) -> Result<NegotiationSession, TransportError> {
        let events = TransportEvents::new(key.clone(), self.events_tx.clone());
        let transport = self.factory.create(&key, events).await?;
        Ok(NegotiationSession::new(key, transport))
    }

    async fn dispatch_signal(&mut self, from: &PeerId, msg: &Value) -> Result<(), SignalError> {
        if !self.known_peers.contains(from) {
            return Err(SignalError::UnknownSender(from.clone()));
        }
        let payload = SignalPayload::from_value(msg)?;
        trace!(peer = %from, kind = payload.kind(), handshake = %payload.handshake_id(), "signal");

        match payload {
            SignalPayload::Offer(desc) => self.on_offer(from, desc).await,
            SignalPayload::Answer(desc) => self.on_answer(from, desc).await,
            SignalPayload::InCandidate(signal) => {
                self.on_candidate(from, Direction::Inbound, signal).await
            }
            SignalPayload::OutCandidate(signal) => {
                self.on_candidate(from, Direction::Outbound, signal).await
            }
        }
    }

    async fn on_offer(&mut self, from: &PeerId, desc: SessionDescription) -> Result<(), SignalError> {
        if self
            .inbound
            .get(from)
            .is_some_and(|session| session.handshake_id() != desc.handshake_id)
        {
            info!(peer = %from, "remote peer restarted its outbound session");
            self.close_session(Direction::Inbound, from).await;
        }
        if !self.inbound.contains_key(from) {
            self.open_inbound(from, desc.handshake_id).await?;
            let held = self.held_candidates.remove(from).unwrap_or_default();
            if let Some(session) = self.inbound.get_mut(from) {
                for (_, candidate) in held
                    .into_iter()
                    .filter(|(handshake_id, _)| *handshake_id == desc.handshake_id)
                {
                    session.add_remote_candidate(candidate).await?;
                }
            }
        }

        let Some(session) = self.inbound.get_mut(from) else {
            return Err(absent(from, Direction::Inbound, desc.handshake_id));
        };
        let before = session.state();
        match session.accept_offer(&desc.sdp).await {
            Ok(answer) => {
                send_signal(&self.outgoing, from, &answer);
                announce(&self.notifications, session, before);
                Ok(())
            }
            Err(e) => {
                self.abandon_if_fatal(Direction::Inbound, from, &e).await;
                Err(e.into())
            }
        }
    }

    async fn on_answer(&mut self, from: &PeerId, desc: SessionDescription) -> Result<(), SignalError> {
        let Some(session) = self
            .outbound
            .get_mut(from)
            .filter(|session| session.handshake_id() == desc.handshake_id)
        else {
            return Err(absent(from, Direction::Outbound, desc.handshake_id));
        };
        let before = session.state();
        match session.accept_answer(&desc.sdp).await {
            Ok(again) => {
                announce(&self.notifications, session, before);
                if again {
                    self.renegotiate(from).await;
                }
                Ok(())
            }
            Err(e) => {
                self.abandon_if_fatal(Direction::Outbound, from, &e).await;
                Err(e.into())
            }
        }
    }

    async fn on_candidate(
        &mut self,
        from: &PeerId,
        direction: Direction,
        signal: CandidateSignal,
    ) -> Result<(), SignalError> {
        if direction == Direction::Inbound {
            match self.inbound.get(from).map(|session| session.handshake_id()) {
                // Offer not here yet: hold the candidate on a session for its handshake.
                None => self.open_inbound(from, signal.handshake_id).await?,
                Some(current) if current != signal.handshake_id => {
                    // Either a replacement offer is on its way or the handshake
                    // is already retired. Only a matching offer picks it up.
                    trace!(peer = %from, handshake = %signal.handshake_id, "holding candidate for another handshake");
                    self.held_candidates
                        .entry(from.clone())
                        .or_default()
                        .push((signal.handshake_id, signal.candidate));
                    return Ok(());
                }
                Some(_) => {}
            }
        }

        let Some(session) = self
            .sessions_mut(direction)
            .get_mut(from)
            .filter(|session| session.handshake_id() == signal.handshake_id)
        else {
            return Err(absent(from, direction, signal.handshake_id));
        };
        match session.add_remote_candidate(signal.candidate).await {
            Ok(disposition) => {
                trace!(peer = %from, %direction, ?disposition, "remote candidate");
                Ok(())
            }
            Err(e) => {
                self.abandon_if_fatal(direction, from, &e).await;
                Err(e.into())
            }
        }
    }

    async fn open_inbound(&mut self, from: &PeerId, handshake_id: HandshakeId) -> Result<(), SignalError> {
        let key = SessionKey::new(from.clone(), Direction::Inbound, handshake_id);
        let session = self.new_session(key).await.map_err(SessionError::from)?;
        self.inbound.insert(from.clone(), session);
        Ok(())
    }

    async fn on_transport_event(&mut self, key: SessionKey, event: TransportEvent) {
        let sessions = match key.direction {
            Direction::Inbound => &mut self.inbound,
            Direction::Outbound => &mut self.outbound,
        };
        let Some(session) = sessions
            .get_mut(&key.peer)
            .filter(|session| session.handshake_id() == key.handshake_id)
        else {
            trace!(peer = %key.peer, direction = %key.direction, "dropping event from a retired session");
            return;
        };

        match event {
            TransportEvent::IceCandidate(Some(candidate)) => {
                let signal = CandidateSignal {
                    candidate,
                    handshake_id: key.handshake_id,
                };
                // The remote end holds the opposite direction of this link.
                let payload = match key.direction {
                    Direction::Outbound => SignalPayload::InCandidate(signal),
                    Direction::Inbound => SignalPayload::OutCandidate(signal),
                };
                send_signal(&self.outgoing, &key.peer, &payload);
            }
            TransportEvent::IceCandidate(None) => {
                trace!(peer = %key.peer, direction = %key.direction, "candidate gathering complete")
            }
            TransportEvent::Track { role, track_id } => {
                debug!(peer = %key.peer, %role, track = %track_id, "remote track");
                let _ = self.notifications.send(PeerNotification::RemoteTrack {
                    peer: key.peer.clone(),
                    role,
                    track_id,
                });
            }
            TransportEvent::ConnectionState(state) => {
                let before = session.state();
                match session.on_connection_state(state) {
                    Some(SessionState::Failed) => {
                        self.fail_session(key.direction, &key.peer).await
                    }
                    Some(_) => announce(&self.notifications, session, before),
                    None => {}
                }
            }
        }
    }

    async fn start_media(&mut self, role: MediaRole, track: LocalTrack) {
        info!(%role, track = %track.id, "starting local media");
        let replaced = self.local_media.insert(role, track.clone());

        let peers: Vec<PeerId> = self.outbound.keys().cloned().collect();
        for peer in peers {
            let Some(session) = self.outbound.get_mut(&peer) else {
                continue;
            };
            match session.set_track(role, &track).await {
                Ok(true) => self.renegotiate(&peer).await,
                Ok(false) => {}
                Err(e) => {
                    warn!(peer = %peer, "failed to attach {}: {}", role, e);
                    self.abandon_if_fatal(Direction::Outbound, &peer, &e).await;
                }
            }
        }
        if let Some(previous) = replaced.filter(|previous| previous.id != track.id) {
            self.factory.release_track(&previous);
        }
        self.establish_missing().await;
    }

    async fn stop_media(&mut self, role: MediaRole) {
        let Some(track) = self.local_media.remove(&role) else {
            return;
        };
        info!(%role, "stopping local media");

        let peers: Vec<PeerId> = self.outbound.keys().cloned().collect();
        for peer in peers {
            let Some(session) = self.outbound.get_mut(&peer) else {
                continue;
            };
            let result = session.drop_track(role).await;
            let unused = !session.has_tracks();
            match result {
                Ok(_) if unused => self.close_session(Direction::Outbound, &peer).await,
                Ok(true) => self.renegotiate(&peer).await,
                Ok(false) => {}
                Err(e) => {
                    warn!(peer = %peer, "failed to detach {}: {}", role, e);
                    self.abandon_if_fatal(Direction::Outbound, &peer, &e).await;
                }
            }
        }
        self.factory.release_track(&track);
    }

    async fn renegotiate(&mut self, peer: &PeerId) {
        let Some(session) = self.outbound.get_mut(peer) else {
            return;
        };
        match session.renegotiate().await {
            Ok(offer) => send_signal(&self.outgoing, peer, &offer),
            Err(e) => {
                warn!(peer = %peer, "renegotiation failed: {}", e);
                self.abandon_if_fatal(Direction::Outbound, peer, &e).await;
            }
        }
    }

    async fn abandon_if_fatal(&mut self, direction: Direction, peer: &PeerId, error: &SessionError) {
        if error.is_fatal() {
            self.fail_session(direction, peer).await;
        }
    }

    async fn fail_session(&mut self, direction: Direction, peer: &PeerId) {
        if let Some(mut session) = self.sessions_mut(direction).remove(peer) {
            warn!(peer = %peer, %direction, handshake = %session.handshake_id(), "session failed");
            session.fail();
            session.close().await;
            announce_final(&self.notifications, &session);
        }
    }

    async fn close_session(&mut self, direction: Direction, peer: &PeerId) {
        if let Some(mut session) = self.sessions_mut(direction).remove(peer) {
            debug!(peer = %peer, %direction, handshake = %session.handshake_id(), "closing session");
            session.close().await;
            announce_final(&self.notifications, &session);
        }
    }

    async fn close_all(&mut self) {
        let outbound = std::mem::take(&mut self.outbound);
        let inbound = std::mem::take(&mut self.inbound);
        self.held_candidates.clear();
        for (_, mut session) in outbound.into_iter().chain(inbound) {
            session.close().await;
            announce_final(&self.notifications, &session);
        }
    }

    fn sessions_mut(&mut self, direction: Direction) -> &mut BTreeMap<PeerId, NegotiationSession> {
        match direction {
            Direction::Inbound => &mut self.inbound,
            Direction::Outbound => &mut self.outbound,
        }
    }
}

fn absent(peer: &PeerId, direction: Direction, handshake_id: HandshakeId) -> SignalError {
    SignalError::SessionAbsent {
        peer: peer.clone(),
        direction,
        handshake_id,
    }
}

fn report_dropped(from: &PeerId, error: &SignalError) {
    match error {
        SignalError::UnknownSender(_) | SignalError::SessionAbsent { .. } => {
            debug!(peer = %from, "dropping envelope: {}", error)
        }
        _ => warn!(peer = %from, "dropping envelope: {}", error),
    }
}

fn send_signal(outgoing: &mpsc::UnboundedSender<ClientMessage>, to: &PeerId, payload: &SignalPayload) {
    match ClientMessage::signal(to.clone(), payload) {
        Ok(message) => {
            if outgoing.send(message).is_err() {
                debug!(peer = %to, "signaling channel closed; dropping {}", payload.kind());
            }
        }
        Err(e) => warn!(peer = %to, "failed to encode {}: {}", payload.kind(), e),
    }
}

fn announce(
    notifications: &mpsc::UnboundedSender<PeerNotification>,
    session: &NegotiationSession,
    before: SessionState,
) {
    if session.state() != before {
        announce_final(notifications, session);
    }
}

fn announce_final(
    notifications: &mpsc::UnboundedSender<PeerNotification>,
    session: &NegotiationSession,
) {
    let _ = notifications.send(PeerNotification::SessionStateChanged {
        peer: session.peer().clone(),
        direction: session.direction(),
        state: session.state(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockFactory, MockOptions, TransportCall};
    use crate::transport::SdpKind;
    use mesh_proto::IceCandidate;

    struct Harness {
        orchestrator: Orchestrator,
        outgoing: mpsc::UnboundedReceiver<ClientMessage>,
        notifications: mpsc::UnboundedReceiver<PeerNotification>,
        factory: MockFactory,
    }

    impl Harness {
        fn new(options: MockOptions) -> Self {
            let factory = MockFactory::new(options);
            let (tx, outgoing) = mpsc::unbounded_channel();
            let (orchestrator, _handle, notifications) =
                Orchestrator::new(&PeerConfig::localhost(), Arc::new(factory.clone()), tx);
            Self {
                orchestrator,
                outgoing,
                notifications,
                factory,
            }
        }

        async fn join(&mut self, local: &str, peers: &[&str], version: u64) {
            self.orchestrator
                .handle(OrchestratorEvent::Welcome(PeerId::from(local)))
                .await;
            self.roster(peers, version).await;
        }

        async fn roster(&mut self, peers: &[&str], version: u64) {
            let state = PresenceState::new(peers.iter().map(|p| PeerId::from(*p)), version);
            self.orchestrator
                .handle(OrchestratorEvent::Presence(state))
                .await;
            self.orchestrator.process_pending().await;
        }

        async fn signal(&mut self, from: &str, payload: SignalPayload) {
            let msg = payload.to_value().unwrap();
            self.orchestrator
                .handle(OrchestratorEvent::Signal {
                    from: PeerId::from(from),
                    msg,
                })
                .await;
            self.orchestrator.process_pending().await;
        }

        async fn start(&mut self, role: MediaRole) {
            let track = LocalTrack::for_role(role);
            self.orchestrator
                .handle(OrchestratorEvent::StartMedia { role, track })
                .await;
            self.orchestrator.process_pending().await;
        }

        fn sent(&mut self) -> Vec<(PeerId, SignalPayload)> {
            let mut sent = Vec::new();
            while let Ok(message) = self.outgoing.try_recv() {
                if let ClientMessage::Webrtc { to, msg } = message {
                    sent.push((to, SignalPayload::from_value(&msg).unwrap()));
                }
            }
            sent
        }

        fn notified(&mut self) -> Vec<PeerNotification> {
            let mut seen = Vec::new();
            while let Ok(notification) = self.notifications.try_recv() {
                seen.push(notification);
            }
            seen
        }
    }

    fn offer(handshake_id: HandshakeId) -> SignalPayload {
        SignalPayload::Offer(SessionDescription {
            sdp: "v=0 remote offer".into(),
            handshake_id,
        })
    }

    fn in_candidate(handshake_id: HandshakeId, n: u8) -> SignalPayload {
        SignalPayload::InCandidate(CandidateSignal {
            candidate: IceCandidate::new(format!("candidate:{n} 1 udp 1 10.2.2.{n} 9 typ host")),
            handshake_id,
        })
    }

    fn peer(id: &str) -> PeerId {
        PeerId::from(id)
    }

    #[test_timeout::tokio_timeout_test]
    async fn outbound_links_wait_for_local_media() {
        let mut h = Harness::new(MockOptions::default());
        h.join("a", &["a", "b", "c"], 1).await;
        assert!(h.sent().is_empty());
        assert!(h.factory.handles().is_empty());

        h.start(MediaRole::Camera).await;
        let sent = h.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent
            .iter()
            .all(|(_, payload)| matches!(payload, SignalPayload::Offer(_))));
        let targets: BTreeSet<PeerId> = sent.into_iter().map(|(to, _)| to).collect();
        assert_eq!(targets, BTreeSet::from([peer("b"), peer("c")]));

        let snapshot = h.orchestrator.snapshot();
        let session = snapshot.session(&peer("b"), Direction::Outbound).unwrap();
        assert_eq!(session.state, SessionState::OfferSent);
        assert_eq!(session.roles, vec![MediaRole::Camera]);
        assert!(snapshot.session(&peer("a"), Direction::Outbound).is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn starting_the_same_media_twice_changes_nothing() {
        let mut h = Harness::new(MockOptions::default());
        h.join("a", &["a", "b"], 1).await;
        let track = LocalTrack::for_role(MediaRole::Camera);
        for _ in 0..2 {
            h.orchestrator
                .handle(OrchestratorEvent::StartMedia {
                    role: MediaRole::Camera,
                    track: track.clone(),
                })
                .await;
        }
        assert_eq!(h.sent().len(), 1);
        assert_eq!(h.factory.handles().len(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn stale_rosters_are_ignored() {
        let mut h = Harness::new(MockOptions::default());
        h.join("a", &["a", "b"], 5).await;
        h.start(MediaRole::Microphone).await;

        h.roster(&["a"], 4).await;
        assert_eq!(h.orchestrator.snapshot().roster_version, Some(5));
        assert!(h
            .orchestrator
            .snapshot()
            .session(&peer("b"), Direction::Outbound)
            .is_some());

        h.roster(&["a"], 6).await;
        let snapshot = h.orchestrator.snapshot();
        assert!(snapshot.sessions.is_empty());
        assert_eq!(snapshot.known_peers, vec![peer("a")]);
        assert!(h.factory.handles()[0].is_closed());
        assert!(h
            .notified()
            .contains(&PeerNotification::PeerReleased { peer: peer("b") }));
    }

    #[test_timeout::tokio_timeout_test]
    async fn envelopes_from_unknown_peers_are_dropped() {
        let mut h = Harness::new(MockOptions::default());
        h.join("a", &["a"], 1).await;
        h.signal("z", offer(HandshakeId::new())).await;
        assert!(h.orchestrator.snapshot().sessions.is_empty());
        assert!(h.sent().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn malformed_envelopes_are_dropped() {
        let mut h = Harness::new(MockOptions::default());
        h.join("a", &["a", "b"], 1).await;
        h.orchestrator
            .handle(OrchestratorEvent::Signal {
                from: peer("b"),
                msg: serde_json::json!({ "offer": { "sdp": 7 } }),
            })
            .await;
        assert!(h.orchestrator.snapshot().sessions.is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn early_candidates_wait_for_the_offer() {
        let mut h = Harness::new(MockOptions::default());
        h.join("a", &["a", "d"], 1).await;
        let handshake = HandshakeId::new();

        h.signal("d", in_candidate(handshake, 1)).await;
        h.signal("d", in_candidate(handshake, 2)).await;
        let snapshot = h.orchestrator.snapshot();
        let session = snapshot.session(&peer("d"), Direction::Inbound).unwrap();
        assert_eq!(session.state, SessionState::Idle);
        assert_eq!(session.pending_candidates, 2);

        h.signal("d", offer(handshake)).await;
        let sent = h.sent();
        assert!(matches!(&sent[..], [(to, SignalPayload::Answer(desc))]
            if *to == peer("d") && desc.handshake_id == handshake));

        let mock = &h.factory.handles_for(&peer("d"), Direction::Inbound)[0];
        let calls = mock.calls();
        assert!(matches!(calls[0], TransportCall::SetRemote(SdpKind::Offer, _)));
        assert!(matches!(calls[1], TransportCall::AddCandidate(_)));
        assert!(matches!(calls[2], TransportCall::AddCandidate(_)));
        assert_eq!(mock.count(|c| matches!(c, TransportCall::AddCandidate(_))), 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn departure_discards_buffered_candidates() {
        let mut h = Harness::new(MockOptions::default());
        h.join("a", &["a", "d"], 1).await;
        h.signal("d", in_candidate(HandshakeId::new(), 1)).await;

        h.roster(&["a"], 2).await;
        assert!(h.orchestrator.snapshot().sessions.is_empty());
        let mock = &h.factory.handles_for(&peer("d"), Direction::Inbound)[0];
        assert!(mock.is_closed());
        assert_eq!(mock.count(|c| matches!(c, TransportCall::AddCandidate(_))), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn new_handshake_replaces_the_inbound_session() {
        let mut h = Harness::new(MockOptions::default());
        h.join("a", &["a", "b"], 1).await;
        let first = HandshakeId::new();
        let second = HandshakeId::new();

        h.signal("b", offer(first)).await;
        h.signal("b", offer(first)).await;
        assert_eq!(h.factory.handles().len(), 1);

        h.signal("b", offer(second)).await;
        let mocks = h.factory.handles_for(&peer("b"), Direction::Inbound);
        assert_eq!(mocks.len(), 2);
        assert!(mocks[0].is_closed());
        assert!(!mocks[1].is_closed());

        let snapshot = h.orchestrator.snapshot();
        assert_eq!(snapshot.sessions.len(), 1);
        assert_eq!(snapshot.sessions[0].handshake_id, second);

        // A late candidate for the retired handshake goes nowhere.
        h.signal("b", in_candidate(first, 9)).await;
        assert_eq!(mocks[0].count(|c| matches!(c, TransportCall::AddCandidate(_))), 0);
        assert_eq!(mocks[1].count(|c| matches!(c, TransportCall::AddCandidate(_))), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn candidates_ahead_of_a_replacement_offer_are_kept() {
        let mut h = Harness::new(MockOptions::default());
        h.join("a", &["a", "b"], 1).await;
        let first = HandshakeId::new();
        let second = HandshakeId::new();

        h.signal("b", offer(first)).await;
        h.signal("b", in_candidate(second, 1)).await;
        let mocks = h.factory.handles_for(&peer("b"), Direction::Inbound);
        assert_eq!(mocks.len(), 1);
        assert!(!mocks[0].is_closed());

        h.signal("b", offer(second)).await;
        let mocks = h.factory.handles_for(&peer("b"), Direction::Inbound);
        assert_eq!(mocks.len(), 2);
        assert!(mocks[0].is_closed());
        assert_eq!(mocks[0].count(|c| matches!(c, TransportCall::AddCandidate(_))), 0);
        let calls = mocks[1].calls();
        assert!(matches!(calls[0], TransportCall::SetRemote(SdpKind::Offer, _)));
        assert!(matches!(&calls[1], TransportCall::AddCandidate(c) if c.candidate.contains("10.2.2.1")));
        assert_eq!(mocks[1].count(|c| matches!(c, TransportCall::AddCandidate(_))), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn repeated_rosters_change_nothing() {
        let mut h = Harness::new(MockOptions::default());
        h.join("a", &["a", "b"], 1).await;
        h.start(MediaRole::Camera).await;
        h.sent();
        h.notified();
        let before = h.orchestrator.snapshot();

        h.roster(&["a", "b"], 1).await;
        h.roster(&["a", "b"], 2).await;

        assert_eq!(h.factory.handles().len(), 1);
        assert!(h.sent().is_empty());
        assert!(h.notified().is_empty());
        let after = h.orchestrator.snapshot();
        assert_eq!(after.sessions, before.sessions);
        assert_eq!(after.known_peers, before.known_peers);
        assert_eq!(after.roster_version, Some(2));
    }

    #[test_timeout::tokio_timeout_test]
    async fn stopped_and_replaced_tracks_are_released() {
        let mut h = Harness::new(MockOptions::default());
        h.join("a", &["a", "b"], 1).await;
        let first = LocalTrack::for_role(MediaRole::Camera);
        let second = LocalTrack::for_role(MediaRole::Camera);

        for track in [&first, &first, &second] {
            h.orchestrator
                .handle(OrchestratorEvent::StartMedia {
                    role: MediaRole::Camera,
                    track: track.clone(),
                })
                .await;
        }
        assert_eq!(h.factory.released(), vec![first.id.clone()]);

        h.orchestrator
            .handle(OrchestratorEvent::StopMedia {
                role: MediaRole::Camera,
            })
            .await;
        assert_eq!(h.factory.released(), vec![first.id, second.id]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn answers_for_other_handshakes_are_ignored() {
        let mut h = Harness::new(MockOptions::default());
        h.join("a", &["a", "b"], 1).await;
        h.start(MediaRole::Camera).await;
        h.sent();

        h.signal(
            "b",
            SignalPayload::Answer(SessionDescription {
                sdp: "v=0".into(),
                handshake_id: HandshakeId::new(),
            }),
        )
        .await;
        let snapshot = h.orchestrator.snapshot();
        let session = snapshot.session(&peer("b"), Direction::Outbound).unwrap();
        assert_eq!(session.state, SessionState::OfferSent);
    }

    #[test_timeout::tokio_timeout_test]
    async fn local_candidates_are_addressed_to_the_opposite_session() {
        let options = MockOptions {
            candidates: 1,
            ..MockOptions::default()
        };
        let mut h = Harness::new(options);
        h.join("a", &["a", "b"], 1).await;

        h.start(MediaRole::Camera).await;
        let sent = h.sent();
        assert!(matches!(sent[0].1, SignalPayload::Offer(_)));
        assert!(matches!(sent[1].1, SignalPayload::InCandidate(_)));
        assert_eq!(sent[0].1.handshake_id(), sent[1].1.handshake_id());

        let remote = HandshakeId::new();
        h.signal("b", offer(remote)).await;
        let sent = h.sent();
        assert!(matches!(sent[0].1, SignalPayload::Answer(_)));
        assert!(matches!(&sent[1].1, SignalPayload::OutCandidate(s) if s.handshake_id == remote));
    }

    #[test_timeout::tokio_timeout_test]
    async fn stopping_the_last_role_closes_outbound_links() {
        let mut h = Harness::new(MockOptions::default());
        h.join("a", &["a", "b"], 1).await;
        h.start(MediaRole::Camera).await;
        h.start(MediaRole::Microphone).await;

        h.orchestrator
            .handle(OrchestratorEvent::StopMedia {
                role: MediaRole::Camera,
            })
            .await;
        let snapshot = h.orchestrator.snapshot();
        assert_eq!(
            snapshot
                .session(&peer("b"), Direction::Outbound)
                .unwrap()
                .roles,
            vec![MediaRole::Microphone]
        );

        h.orchestrator
            .handle(OrchestratorEvent::StopMedia {
                role: MediaRole::Microphone,
            })
            .await;
        assert!(h.orchestrator.snapshot().sessions.is_empty());
        assert!(h.factory.handles()[0].is_closed());
    }

    #[test_timeout::tokio_timeout_test]
    async fn stalled_negotiations_fail_and_are_retried() {
        let mut h = Harness::new(MockOptions::default());
        h.join("a", &["a", "b"], 1).await;
        h.start(MediaRole::Camera).await;
        h.sent();
        h.notified();

        h.orchestrator
            .maintain(Instant::now() + Duration::from_secs(31))
            .await;

        let mocks = h.factory.handles_for(&peer("b"), Direction::Outbound);
        assert_eq!(mocks.len(), 2);
        assert!(mocks[0].is_closed());
        assert!(h.notified().contains(&PeerNotification::SessionStateChanged {
            peer: peer("b"),
            direction: Direction::Outbound,
            state: SessionState::Failed,
        }));
        let sent = h.sent();
        assert!(matches!(&sent[..], [(_, SignalPayload::Offer(desc))]
            if desc.handshake_id == mocks[1].key.handshake_id));
    }

    #[test_timeout::tokio_timeout_test]
    async fn failed_connections_release_the_session() {
        let mut h = Harness::new(MockOptions::default());
        h.join("a", &["a", "b"], 1).await;
        h.signal("b", offer(HandshakeId::new())).await;

        let mock = h.factory.handles()[0].clone();
        mock.emit(TransportEvent::ConnectionState(
            crate::transport::ConnectionState::Failed,
        ));
        h.orchestrator.process_pending().await;
        assert!(h.orchestrator.snapshot().sessions.is_empty());
        assert!(mock.is_closed());
    }

    #[test_timeout::tokio_timeout_test]
    async fn losing_the_relay_releases_everyone() {
        let mut h = Harness::new(MockOptions::default());
        h.join("a", &["a", "b", "c"], 3).await;
        h.start(MediaRole::Screen).await;
        h.notified();

        h.orchestrator.handle(OrchestratorEvent::RelayLost).await;
        let snapshot = h.orchestrator.snapshot();
        assert!(snapshot.sessions.is_empty());
        assert!(snapshot.known_peers.is_empty());
        assert_eq!(snapshot.roster_version, None);
        let notified = h.notified();
        let released = notified
            .iter()
            .filter(|n| matches!(n, PeerNotification::PeerReleased { .. }))
            .count();
        assert_eq!(released, 2);
        assert_eq!(notified.last(), Some(&PeerNotification::RelayLost));

        // A restarted relay counts versions from the beginning again.
        h.join("a2", &["a2", "b"], 1).await;
        assert_eq!(h.orchestrator.snapshot().sessions.len(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn remote_tracks_are_reported_until_the_session_retires() {
        let mut h = Harness::new(MockOptions::default());
        h.join("a", &["a", "b"], 1).await;
        h.signal("b", offer(HandshakeId::new())).await;
        h.notified();

        let mock = h.factory.handles()[0].clone();
        mock.emit(TransportEvent::Track {
            role: MediaRole::Screen,
            track_id: "screen-1".into(),
        });
        h.orchestrator.process_pending().await;
        assert_eq!(
            h.notified(),
            vec![PeerNotification::RemoteTrack {
                peer: peer("b"),
                role: MediaRole::Screen,
                track_id: "screen-1".into(),
            }]
        );

        h.signal("b", offer(HandshakeId::new())).await;
        h.notified();
        mock.emit(TransportEvent::Track {
            role: MediaRole::Camera,
            track_id: "late".into(),
        });
        h.orchestrator.process_pending().await;
        assert!(h.notified().is_empty());
    }
}
