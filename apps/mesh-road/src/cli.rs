use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use mesh_proto::{ClientMessage, ServerMessage, SignalPayload};
use std::net::IpAddr;
use tokio::time::{interval, timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

#[derive(Parser, Debug)]
#[command(name = "mesh-road")]
#[command(about = "Mesh presence registry and signaling relay")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Address to listen on (overrides MESH_ROAD_BIND)
    #[arg(long)]
    pub bind: Option<IpAddr>,

    /// Port to listen on (overrides MESH_ROAD_PORT)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Evict peers silent for this many seconds; 0 disables eviction
    #[arg(long)]
    pub heartbeat_timeout: Option<u64>,

    /// Expose Prometheus metrics at /metrics
    #[arg(long)]
    pub metrics: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join the mesh as a passive peer and print roster changes and envelopes
    Watch {
        /// Relay websocket URL
        #[arg(short, long, default_value = "ws://localhost:3000/ws")]
        url: String,

        /// Stop after this many frames
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },
}

pub async fn run_watch_client(url: String, count: Option<usize>) -> Result<()> {
    debug!("Connecting to {}", url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(url.as_str())).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", url, e);
            return Err(anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            return Err(anyhow!(
                "Connection timeout - is the relay running at {}?",
                url
            ));
        }
    };
    let (mut write, mut read) = ws_stream.split();
    let mut heartbeat = interval(Duration::from_secs(30));
    let mut seen = 0usize;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let ping = serde_json::to_string(&ClientMessage::Ping)?;
                write.send(Message::Text(ping)).await.context("failed to send ping")?;
            }
            frame = read.next() => {
                let Some(frame) = frame else { break };
                let text = match frame.context("websocket error")? {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };
                match ServerMessage::from_json(&text) {
                    Ok(message) => println!("{}", describe(&message)),
                    Err(e) => println!("unparseable frame: {e}"),
                }
                seen += 1;
                if count.is_some_and(|limit| seen >= limit) {
                    break;
                }
            }
        }
    }

    let _ = write.close().await;
    Ok(())
}

fn describe(message: &ServerMessage) -> String {
    match message {
        ServerMessage::Welcome { peer_id } => format!("welcome: assigned {peer_id}"),
        ServerMessage::Update { peers, version } => {
            let ids: Vec<&str> = peers.iter().map(|p| p.as_str()).collect();
            format!("update v{version}: [{}]", ids.join(", "))
        }
        ServerMessage::Webrtc { from, msg } => match SignalPayload::from_value(msg) {
            Ok(payload) => format!(
                "webrtc from {from}: {} (handshake {})",
                payload.kind(),
                payload.handshake_id()
            ),
            Err(e) => format!("webrtc from {from}: {e}"),
        },
        ServerMessage::Pong => "pong".to_string(),
        ServerMessage::Error { message } => format!("error: {message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_proto::PeerId;

    #[test_timeout::timeout]
    fn describes_roster_updates() {
        let line = describe(&ServerMessage::Update {
            peers: vec![PeerId::from("a"), PeerId::from("b")],
            version: 4,
        });
        assert_eq!(line, "update v4: [a, b]");
    }

    #[test_timeout::timeout]
    fn describes_malformed_envelopes() {
        let line = describe(&ServerMessage::Webrtc {
            from: PeerId::from("a"),
            msg: serde_json::json!({ "bogus": 1 }),
        });
        assert!(line.starts_with("webrtc from a: malformed"));
    }
}
