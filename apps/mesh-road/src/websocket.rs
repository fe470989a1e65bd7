use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use mesh_proto::{ClientMessage, PeerId, ServerMessage};
use std::net::SocketAddr;
use tracing::{debug, error, info, warn};

use crate::registry::{Membership, Registry, RelayError};

/// State shared by websocket connections.
#[derive(Clone)]
pub struct SignalingState {
    registry: Registry,
}

impl SignalingState {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(signaling): State<SignalingState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, signaling, remote_addr))
}

/// Handle a WebSocket connection for its whole lifetime: join on connect,
/// leave on disconnect.
async fn handle_socket(socket: WebSocket, state: SignalingState, remote_addr: SocketAddr) {
    let Membership {
        peer_id,
        mut messages,
    } = match state.registry.join().await {
        Ok(membership) => membership,
        Err(e) => {
            error!("Failed to register peer from {}: {}", remote_addr, e);
            return;
        }
    };
    let (mut sender, mut receiver) = socket.split();

    // Drain the membership channel into the socket. The channel closes when the
    // registry evicts this peer, which also closes the socket.
    let writer_peer = peer_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(msg) = messages.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(peer = %writer_peer, "failed to encode frame: {}", e),
            }
        }
        let _ = sender.close().await;
        debug!(peer = %writer_peer, "writer task ended");
    });

    info!(peer = %peer_id, remote = %remote_addr, "websocket connected");

    while let Some(msg_result) = receiver.next().await {
        let msg = match msg_result {
            Ok(m) => m,
            Err(e) => {
                debug!(peer = %peer_id, "websocket error: {}", e);
                break;
            }
        };

        match msg {
            Message::Text(text) => handle_frame(&state, &peer_id, &text).await,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => handle_frame(&state, &peer_id, &text).await,
                Err(_) => debug!(peer = %peer_id, "ignoring non-UTF8 binary frame"),
            },
            Message::Close(_) => break,
            // Ping/Pong frames are answered by axum
            _ => {}
        }
    }

    state.registry.leave(&peer_id);
    writer.abort();
    info!(peer = %peer_id, "websocket disconnected");
}

async fn handle_frame(state: &SignalingState, peer_id: &PeerId, text: &str) {
    let message = match ClientMessage::from_json(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(peer = %peer_id, "failed to parse client frame: {}", e);
            state.registry.notify(
                peer_id,
                ServerMessage::Error {
                    message: format!("Invalid message format: {}", e),
                },
            );
            return;
        }
    };

    match message {
        ClientMessage::Webrtc { to, msg } => {
            match state.registry.relay(peer_id, to, msg).await {
                Ok(()) => {}
                // The sender is never told; it recovers on the next roster update.
                Err(RelayError::RecipientMissing(to)) => {
                    debug!(from = %peer_id, to = %to, "recipient missing; envelope dropped")
                }
                Err(e) => debug!(from = %peer_id, "envelope dropped: {}", e),
            }
        }
        ClientMessage::Ping => state.registry.heartbeat(peer_id),
    }
}
