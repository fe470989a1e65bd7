//! Websocket link to the relay.
//!
//! Three tasks: a writer draining the outgoing channel, a reader feeding
//! relay frames into the orchestrator, and a keep-alive ping.

use futures_util::{SinkExt, StreamExt};
use mesh_proto::{ClientMessage, ServerMessage};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::error::{Error as WsError, ProtocolError};
use tokio_tungstenite::tungstenite::Message;

use crate::error::PeerError;
use crate::orchestrator::{OrchestratorEvent, OrchestratorHandle};

pub struct SignalingClient {
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Connect to `url`. Frames queued on `outgoing` are written to the relay;
    /// relay frames are delivered to `orchestrator`. When the socket ends the
    /// orchestrator receives [`OrchestratorEvent::RelayLost`].
    pub async fn connect(
        url: &str,
        send_tx: mpsc::UnboundedSender<ClientMessage>,
        mut outgoing: mpsc::UnboundedReceiver<ClientMessage>,
        orchestrator: OrchestratorHandle,
        heartbeat: Duration,
    ) -> Result<Self, PeerError> {
        let (ws_stream, _) = connect_async(url).await.map_err(|err| PeerError::Connect {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        tracing::debug!(target = "signaling", url = %url, "relay websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let writer_handle = tokio::spawn(async move {
            while let Some(message) = outgoing.recv().await {
                match serde_json::to_string(&message) {
                    Ok(text) => {
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target = "signaling", "failed to encode frame: {err}")
                    }
                }
            }
            let _ = ws_write.close().await;
        });

        let reader_handle = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target = "signaling", "relay websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target = "signaling", "relay websocket error: {err}");
                            }
                        }
                        break;
                    }
                };
                tracing::trace!(target = "signaling", event = "ws_in", len = text.len());

                let frame = match ServerMessage::from_json(&text) {
                    Ok(frame) => frame,
                    Err(err) => {
                        tracing::warn!(target = "signaling", "unparseable relay frame: {err}");
                        continue;
                    }
                };
                if let Some(event) = OrchestratorEvent::from_server(frame) {
                    if orchestrator.deliver(event).is_err() {
                        return;
                    }
                }
            }
            let _ = orchestrator.deliver(OrchestratorEvent::RelayLost);
        });

        let heartbeat_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if send_tx.send(ClientMessage::Ping).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            tasks: Mutex::new(vec![writer_handle, reader_handle, heartbeat_handle]),
        })
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}
