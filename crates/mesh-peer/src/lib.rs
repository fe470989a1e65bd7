//! A mesh node: keeps one outbound media session to every other peer in the
//! relay's roster while local media is active, and answers every peer that
//! offers its own.
//!
//! ```no_run
//! # async fn demo() -> Result<(), mesh_peer::PeerError> {
//! use mesh_peer::{LocalTrack, MediaRole, MeshPeer, PeerConfig};
//!
//! let mut peer = MeshPeer::join(PeerConfig::from_env()).await?;
//! peer.handle().start_media(MediaRole::Camera, LocalTrack::for_role(MediaRole::Camera))?;
//! while let Some(notification) = peer.next_notification().await {
//!     println!("{notification:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod media;
pub mod orchestrator;
pub mod session;
pub mod signaling;
pub mod transport;

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use config::PeerConfig;
pub use error::{PeerError, SignalError};
pub use media::{LocalTrack, MediaKind, MediaRole};
pub use orchestrator::{
    Orchestrator, OrchestratorEvent, OrchestratorHandle, OrchestratorSnapshot, PeerNotification,
    SessionSnapshot,
};
pub use session::{NegotiationSession, SessionError, SessionState};
pub use signaling::SignalingClient;
pub use transport::webrtc::WebRtcFactory;
pub use transport::{
    ConnectionState, Direction, NegotiationTransport, SessionKey, TrackUpdate, TransportError,
    TransportEvent, TransportEvents, TransportFactory,
};

/// A running node: orchestrator task plus its relay connection.
pub struct MeshPeer {
    handle: OrchestratorHandle,
    notifications: mpsc::UnboundedReceiver<PeerNotification>,
    factory: Option<Arc<WebRtcFactory>>,
    _signaling: SignalingClient,
    task: JoinHandle<()>,
}

impl MeshPeer {
    /// Connect to the relay with a webrtc-rs media stack.
    pub async fn join(config: PeerConfig) -> Result<Self, PeerError> {
        let factory = Arc::new(WebRtcFactory::new(&config)?);
        let mut peer = Self::join_with(config, factory.clone()).await?;
        peer.factory = Some(factory);
        Ok(peer)
    }

    /// Connect to the relay with any transport implementation.
    pub async fn join_with(
        config: PeerConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self, PeerError> {
        let (send_tx, outgoing) = mpsc::unbounded_channel();
        let (orchestrator, handle, notifications) =
            Orchestrator::new(&config, factory, send_tx.clone());
        let signaling = SignalingClient::connect(
            &config.relay_url,
            send_tx,
            outgoing,
            handle.clone(),
            config.heartbeat_interval,
        )
        .await?;
        let task = tokio::spawn(orchestrator.run());

        Ok(Self {
            handle,
            notifications,
            factory: None,
            _signaling: signaling,
            task,
        })
    }

    pub fn handle(&self) -> &OrchestratorHandle {
        &self.handle
    }

    /// The webrtc-rs factory, when joined through [`MeshPeer::join`]; captured
    /// samples are written to its tracks.
    pub fn media(&self) -> Option<&WebRtcFactory> {
        self.factory.as_deref()
    }

    pub async fn next_notification(&mut self) -> Option<PeerNotification> {
        self.notifications.recv().await
    }

    /// Close every session and wait for the orchestrator to stop.
    pub async fn leave(self) {
        self.handle.shutdown();
        let _ = self.task.await;
    }
}
