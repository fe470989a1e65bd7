use mesh_proto::{HandshakeId, PeerId, ProtoError};
use thiserror::Error;

use crate::session::SessionError;
use crate::transport::{Direction, TransportError};

/// Why an inbound envelope was dropped. None of these are fatal to the node.
#[derive(Error, Debug)]
pub enum SignalError {
    #[error("envelope from peer {0} which is not in the roster")]
    UnknownSender(PeerId),

    #[error("no {direction} session for {peer} with handshake {handshake_id}")]
    SessionAbsent {
        peer: PeerId,
        direction: Direction,
        handshake_id: HandshakeId,
    },

    #[error(transparent)]
    Malformed(#[from] ProtoError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("failed to reach relay at {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("orchestrator has stopped")]
    Stopped,

    #[error(transparent)]
    Transport(#[from] TransportError),
}
