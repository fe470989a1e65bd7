//! In-memory transport that records every call, for exercising negotiation
//! without a media stack.

use async_trait::async_trait;
use mesh_proto::{IceCandidate, PeerId};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

use super::{
    ConnectionState, Direction, NegotiationTransport, OfferOptions, SdpKind, SessionKey,
    TrackUpdate, TransportError, TransportEvent, TransportEvents, TransportFactory,
};
use crate::media::{LocalTrack, MediaRole};

#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind, String),
    SetRemote(SdpKind, String),
    AddCandidate(IceCandidate),
    AddOrReplaceTrack(MediaRole, String),
    RemoveTrack(MediaRole),
    Close,
}

#[derive(Debug, Clone, Default)]
pub struct MockOptions {
    /// Report `Connected` once both descriptions are in place
    pub auto_connect: bool,
    /// Local candidates reported after the first local description
    pub candidates: usize,
    /// Make `create_offer` fail
    pub fail_offers: bool,
}

impl MockOptions {
    /// Behaves like a cooperative peer connection on a LAN.
    pub fn connecting() -> Self {
        Self {
            auto_connect: true,
            candidates: 2,
            fail_offers: false,
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<TransportCall>,
    tracks: BTreeSet<MediaRole>,
    local_set: bool,
    remote_set: bool,
    connected: bool,
    gathered: bool,
    closed: bool,
    descriptions: u32,
}

pub struct MockTransport {
    key: SessionKey,
    options: MockOptions,
    state: Arc<Mutex<MockState>>,
    events: TransportEvents,
}

impl MockTransport {
    pub fn new(options: MockOptions, events: TransportEvents) -> Self {
        Self {
            key: events.key().clone(),
            options,
            state: Arc::new(Mutex::new(MockState::default())),
            events,
        }
    }

    pub fn handle(&self) -> MockHandle {
        MockHandle {
            key: self.key.clone(),
            state: self.state.clone(),
            events: self.events.clone(),
        }
    }

    fn record(&self, call: TransportCall) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let closed = state.closed && call != TransportCall::Close;
        state.calls.push(call);
        if closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn description_applied(&self, local: bool) {
        let mut state = self.state.lock();
        if local {
            state.local_set = true;
        } else {
            state.remote_set = true;
        }

        if local && !state.gathered && self.options.candidates > 0 {
            state.gathered = true;
            for n in 1..=self.options.candidates {
                let mut candidate = IceCandidate::new(format!(
                    "candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host"
                ));
                candidate.sdp_mid = Some("0".into());
                candidate.sdp_mline_index = Some(0);
                self.events.emit(TransportEvent::IceCandidate(Some(candidate)));
            }
            self.events.emit(TransportEvent::IceCandidate(None));
        }

        if self.options.auto_connect && state.local_set && state.remote_set && !state.connected {
            state.connected = true;
            self.events
                .emit(TransportEvent::ConnectionState(ConnectionState::Connected));
        }
    }

    fn next_sdp(&self, kind: &str) -> String {
        let mut state = self.state.lock();
        state.descriptions += 1;
        format!(
            "v=0 mock-{kind} {} {} #{}",
            self.key.direction, self.key.handshake_id, state.descriptions
        )
    }
}

#[async_trait]
impl NegotiationTransport for MockTransport {
    async fn create_offer(&self, _options: OfferOptions) -> Result<String, TransportError> {
        self.record(TransportCall::CreateOffer)?;
        if self.options.fail_offers {
            return Err(TransportError::Negotiation("mock offer failure".into()));
        }
        Ok(self.next_sdp("offer"))
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        self.record(TransportCall::CreateAnswer)?;
        Ok(self.next_sdp("answer"))
    }

    async fn set_local_description(&self, kind: SdpKind, sdp: &str) -> Result<(), TransportError> {
        self.record(TransportCall::SetLocal(kind, sdp.to_string()))?;
        self.description_applied(true);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        kind: SdpKind,
        sdp: &str,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::SetRemote(kind, sdp.to_string()))?;
        self.description_applied(false);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        self.record(TransportCall::AddCandidate(candidate.clone()))
    }

    async fn add_or_replace_track(
        &self,
        role: MediaRole,
        track: &LocalTrack,
    ) -> Result<TrackUpdate, TransportError> {
        self.record(TransportCall::AddOrReplaceTrack(role, track.id.clone()))?;
        if self.state.lock().tracks.insert(role) {
            Ok(TrackUpdate::RenegotiationRequired)
        } else {
            Ok(TrackUpdate::InPlace)
        }
    }

    async fn remove_track(&self, role: MediaRole) -> Result<TrackUpdate, TransportError> {
        self.record(TransportCall::RemoveTrack(role))?;
        if self.state.lock().tracks.remove(&role) {
            Ok(TrackUpdate::RenegotiationRequired)
        } else {
            Ok(TrackUpdate::InPlace)
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.record(TransportCall::Close)?;
        self.state.lock().closed = true;
        Ok(())
    }
}

/// Test-side view of a [`MockTransport`] after it has been handed to a session.
#[derive(Clone)]
pub struct MockHandle {
    pub key: SessionKey,
    state: Arc<Mutex<MockState>>,
    events: TransportEvents,
}

impl MockHandle {
    pub fn calls(&self) -> Vec<TransportCall> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, matches: impl Fn(&TransportCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|call| matches(call)).count()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Inject an event as if the media stack raised it.
    pub fn emit(&self, event: TransportEvent) {
        self.events.emit(event);
    }
}

/// Hands out [`MockTransport`]s and keeps a handle to each one.
#[derive(Clone, Default)]
pub struct MockFactory {
    options: MockOptions,
    created: Arc<Mutex<Vec<MockHandle>>>,
    released: Arc<Mutex<Vec<String>>>,
}

impl MockFactory {
    pub fn new(options: MockOptions) -> Self {
        Self {
            options,
            created: Arc::default(),
            released: Arc::default(),
        }
    }

    pub fn handles(&self) -> Vec<MockHandle> {
        self.created.lock().clone()
    }

    /// Ids of local tracks the orchestrator has let go of, in order.
    pub fn released(&self) -> Vec<String> {
        self.released.lock().clone()
    }

    /// Every transport built for `peer` in `direction`, oldest first.
    pub fn handles_for(&self, peer: &PeerId, direction: Direction) -> Vec<MockHandle> {
        self.created
            .lock()
            .iter()
            .filter(|handle| &handle.key.peer == peer && handle.key.direction == direction)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn create(
        &self,
        _key: &SessionKey,
        events: TransportEvents,
    ) -> Result<Box<dyn NegotiationTransport>, TransportError> {
        let transport = MockTransport::new(self.options.clone(), events);
        self.created.lock().push(transport.handle());
        Ok(Box::new(transport))
    }

    fn release_track(&self, track: &LocalTrack) {
        self.released.lock().push(track.id.clone());
    }
}
