//! [`NegotiationTransport`] backed by a webrtc-rs peer connection.

use async_trait::async_trait;
use mesh_proto::IceCandidate;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::{
    ConnectionState, NegotiationTransport, OfferOptions, SdpKind, SessionKey, TrackUpdate,
    TransportError, TransportEvent, TransportEvents, TransportFactory,
};
use crate::config::PeerConfig;
use crate::media::{LocalTrack, MediaKind, MediaRole};

/// Builds one peer connection per session. Local tracks are shared: every
/// session publishing a [`LocalTrack`] writes from the same sample track, so
/// the capture pipeline feeds each track once via [`WebRtcFactory::sample_track`].
pub struct WebRtcFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    tracks: SampleTracks,
}

impl WebRtcFactory {
    pub fn new(config: &PeerConfig) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::Setup(e.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| TransportError::Setup(e.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }]
        };

        Ok(Self {
            api,
            ice_servers,
            tracks: SampleTracks::default(),
        })
    }

    /// The sample track behind `track`, created on first use. Write captured
    /// samples here.
    pub fn sample_track(&self, role: MediaRole, track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
        self.tracks.get_or_create(role, track)
    }
}

#[derive(Clone, Default)]
struct SampleTracks(Arc<Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>>);

impl SampleTracks {
    fn get_or_create(&self, role: MediaRole, track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
        self.0
            .lock()
            .entry(track.id.clone())
            .or_insert_with(|| {
                Arc::new(TrackLocalStaticSample::new(
                    codec_for(track.kind),
                    track.id.clone(),
                    role.as_str().to_string(),
                ))
            })
            .clone()
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn create(
        &self,
        key: &SessionKey,
        events: TransportEvents,
    ) -> Result<Box<dyn NegotiationTransport>, TransportError> {
        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(|e| TransportError::Setup(e.to_string()))?,
        );
        install_handlers(&peer_connection, events);
        debug!(peer = %key.peer, direction = %key.direction, "peer connection created");

        Ok(Box::new(WebRtcTransport {
            peer_connection,
            tracks: self.tracks.clone(),
            senders: AsyncMutex::new(HashMap::new()),
        }))
    }

    fn release_track(&self, track: &LocalTrack) {
        if self.tracks.0.lock().remove(&track.id).is_some() {
            trace!(track = %track.id, "sample track released");
        }
    }
}

fn install_handlers(peer_connection: &Arc<RTCPeerConnection>, events: TransportEvents) {
    let ice_events = events.clone();
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = ice_events.clone();
        Box::pin(async move {
            let candidate = match candidate {
                Some(candidate) => match candidate.to_json() {
                    Ok(init) => Some(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }),
                    Err(e) => {
                        warn!("failed to serialize local candidate: {}", e);
                        return;
                    }
                },
                None => None,
            };
            events.emit(TransportEvent::IceCandidate(candidate));
        })
    }));

    let state_events = events.clone();
    peer_connection.on_peer_connection_state_change(Box::new(
        move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                trace!("peer connection state: {:?}", state);
                let state = match state {
                    RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                        ConnectionState::New
                    }
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                };
                events.emit(TransportEvent::ConnectionState(state));
            })
        },
    ));

    peer_connection.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let events = events.clone();
        Box::pin(async move {
            let role = remote_role(&track);
            events.emit(TransportEvent::Track {
                role,
                track_id: track.id(),
            });
        })
    }));
}

/// Senders publish under their role's name as the stream id; fall back on the
/// media kind for anything else.
fn remote_role(track: &TrackRemote) -> MediaRole {
    track
        .stream_id()
        .parse()
        .unwrap_or(match track.kind() {
            RTPCodecType::Audio => MediaRole::Microphone,
            _ => MediaRole::Camera,
        })
}

fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

pub struct WebRtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    tracks: SampleTracks,
    senders: AsyncMutex<HashMap<MediaRole, Arc<RTCRtpSender>>>,
}

fn negotiation_error(e: webrtc::Error) -> TransportError {
    TransportError::Negotiation(e.to_string())
}

fn description(kind: SdpKind, sdp: &str) -> Result<RTCSessionDescription, TransportError> {
    match kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp.to_owned()),
        SdpKind::Answer => RTCSessionDescription::answer(sdp.to_owned()),
    }
    .map_err(negotiation_error)
}

#[async_trait]
impl NegotiationTransport for WebRtcTransport {
    async fn create_offer(&self, options: OfferOptions) -> Result<String, TransportError> {
        let offer = self
            .peer_connection
            .create_offer(Some(RTCOfferOptions {
                ice_restart: options.ice_restart,
                ..Default::default()
            }))
            .await
            .map_err(negotiation_error)?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(negotiation_error)?;
        Ok(answer.sdp)
    }

    async fn set_local_description(&self, kind: SdpKind, sdp: &str) -> Result<(), TransportError> {
        self.peer_connection
            .set_local_description(description(kind, sdp)?)
            .await
            .map_err(negotiation_error)
    }

    async fn set_remote_description(
        &self,
        kind: SdpKind,
        sdp: &str,
    ) -> Result<(), TransportError> {
        self.peer_connection
            .set_remote_description(description(kind, sdp)?)
            .await
            .map_err(negotiation_error)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(negotiation_error)
    }

    async fn add_or_replace_track(
        &self,
        role: MediaRole,
        track: &LocalTrack,
    ) -> Result<TrackUpdate, TransportError> {
        let sample = self.tracks.get_or_create(role, track);
        let mut senders = self.senders.lock().await;

        if let Some(sender) = senders.get(&role) {
            sender
                .replace_track(Some(sample as Arc<dyn TrackLocal + Send + Sync>))
                .await
                .map_err(|e| TransportError::Track(e.to_string()))?;
            return Ok(TrackUpdate::InPlace);
        }

        let sender = self
            .peer_connection
            .add_track(sample as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| TransportError::Track(e.to_string()))?;

        // RTCP has to be drained for the interceptors to run.
        let rtcp_sender = sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        senders.insert(role, sender);
        Ok(TrackUpdate::RenegotiationRequired)
    }

    async fn remove_track(&self, role: MediaRole) -> Result<TrackUpdate, TransportError> {
        let Some(sender) = self.senders.lock().await.remove(&role) else {
            return Ok(TrackUpdate::InPlace);
        };
        self.peer_connection
            .remove_track(&sender)
            .await
            .map_err(|e| TransportError::Track(e.to_string()))?;
        Ok(TrackUpdate::RenegotiationRequired)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.senders.lock().await.clear();
        self.peer_connection
            .close()
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn codecs_follow_the_media_kind() {
        assert_eq!(codec_for(MediaKind::Audio).mime_type, MIME_TYPE_OPUS);
        assert_eq!(codec_for(MediaKind::Video).clock_rate, 90000);
    }

    #[test_timeout::tokio_timeout_test]
    async fn sample_tracks_are_shared_between_sessions() {
        let factory = WebRtcFactory::new(&PeerConfig::localhost()).unwrap();
        let track = LocalTrack::for_role(MediaRole::Camera);
        let first = factory.sample_track(MediaRole::Camera, &track);
        let second = factory.sample_track(MediaRole::Camera, &track);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.stream_id(), "camera");

        factory.release_track(&track);
        assert!(!Arc::ptr_eq(&first, &factory.sample_track(MediaRole::Camera, &track)));
    }
}
