use mesh_proto::{PeerId, PresenceState, ServerMessage};
use metrics::{counter, gauge};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How often silent members are looked for.
    pub heartbeat_interval: Duration,
    /// Members silent for longer than this are evicted. Zero disables eviction.
    pub heartbeat_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("registry task has stopped")]
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("recipient {0} is not connected")]
    RecipientMissing(PeerId),
    #[error("sender {0} is no longer connected")]
    SenderMissing(PeerId),
    #[error("registry task has stopped")]
    Closed,
}

/// A live membership handed to the connection that joined.
///
/// `messages` yields the `welcome` frame first, then every roster update and
/// relayed envelope addressed to this peer, in the order the registry produced
/// them. The channel closes when the peer is evicted.
#[derive(Debug)]
pub struct Membership {
    pub peer_id: PeerId,
    pub messages: mpsc::UnboundedReceiver<ServerMessage>,
}

enum Command {
    Join {
        reply: oneshot::Sender<Membership>,
    },
    Leave {
        peer_id: PeerId,
    },
    Relay {
        from: PeerId,
        to: PeerId,
        msg: Value,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
    Heartbeat {
        peer_id: PeerId,
    },
    Notify {
        peer_id: PeerId,
        message: ServerMessage,
    },
    Presence {
        reply: oneshot::Sender<PresenceState>,
    },
}

/// Handle to the presence registry.
///
/// All membership changes and relays go through one task, so the roster is only
/// ever mutated by a single writer and every peer observes the same sequence of
/// versions.
#[derive(Clone)]
pub struct Registry {
    commands: mpsc::UnboundedSender<Command>,
}

impl Registry {
    /// Start the registry task on the current runtime.
    pub fn spawn(config: RegistryConfig) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx, config));
        Self { commands }
    }

    pub async fn join(&self) -> Result<Membership, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Join { reply })
            .map_err(|_| RegistryError::Closed)?;
        rx.await.map_err(|_| RegistryError::Closed)
    }

    /// Remove a member. Unknown ids are ignored.
    pub fn leave(&self, peer_id: &PeerId) {
        let _ = self.commands.send(Command::Leave {
            peer_id: peer_id.clone(),
        });
    }

    /// Forward `msg` to `to`, stamped with `from`. The payload is never inspected.
    pub async fn relay(&self, from: &PeerId, to: PeerId, msg: Value) -> Result<(), RelayError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Relay {
                from: from.clone(),
                to,
                msg,
                reply,
            })
            .map_err(|_| RelayError::Closed)?;
        rx.await.map_err(|_| RelayError::Closed)?
    }

    /// Record liveness for `peer_id` and answer with a `pong`.
    pub fn heartbeat(&self, peer_id: &PeerId) {
        let _ = self.commands.send(Command::Heartbeat {
            peer_id: peer_id.clone(),
        });
    }

    /// Queue a frame for a single member behind anything already sent to it.
    pub fn notify(&self, peer_id: &PeerId, message: ServerMessage) {
        let _ = self.commands.send(Command::Notify {
            peer_id: peer_id.clone(),
            message,
        });
    }

    pub async fn presence(&self) -> Result<PresenceState, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Presence { reply })
            .map_err(|_| RegistryError::Closed)?;
        rx.await.map_err(|_| RegistryError::Closed)
    }
}

struct Member {
    tx: mpsc::UnboundedSender<ServerMessage>,
    last_seen: Instant,
}

#[derive(Default)]
struct RegistryState {
    members: BTreeMap<PeerId, Member>,
    version: u64,
}

async fn run(mut commands: mpsc::UnboundedReceiver<Command>, config: RegistryConfig) {
    let mut state = RegistryState::default();
    let evict = !config.heartbeat_timeout.is_zero();
    let mut sweep = tokio::time::interval(config.heartbeat_interval.max(MIN_SWEEP_INTERVAL));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => state.apply(command),
                None => break,
            },
            _ = sweep.tick(), if evict => state.evict_stale(config.heartbeat_timeout),
        }
    }
    debug!("registry task stopped");
}

impl RegistryState {
    fn apply(&mut self, command: Command) {
        match command {
            Command::Join { reply } => {
                let membership = self.join();
                let peer_id = membership.peer_id.clone();
                if reply.send(membership).is_err() {
                    debug!(peer = %peer_id, "joiner went away before welcome");
                    self.leave(&peer_id);
                }
            }
            Command::Leave { peer_id } => self.leave(&peer_id),
            Command::Relay {
                from,
                to,
                msg,
                reply,
            } => {
                let result = self.relay(from, to, msg);
                let _ = reply.send(result);
            }
            Command::Heartbeat { peer_id } => {
                if let Some(member) = self.members.get_mut(&peer_id) {
                    member.last_seen = Instant::now();
                    let _ = member.tx.send(ServerMessage::Pong);
                }
            }
            Command::Notify { peer_id, message } => {
                if let Some(member) = self.members.get(&peer_id) {
                    let _ = member.tx.send(message);
                }
            }
            Command::Presence { reply } => {
                let _ = reply.send(self.presence());
            }
        }
    }

    fn join(&mut self) -> Membership {
        let peer_id = PeerId::generate();
        let (tx, messages) = mpsc::unbounded_channel();
        let _ = tx.send(ServerMessage::Welcome {
            peer_id: peer_id.clone(),
        });
        self.members.insert(
            peer_id.clone(),
            Member {
                tx,
                last_seen: Instant::now(),
            },
        );
        self.version += 1;
        info!(peer = %peer_id, version = self.version, peers = self.members.len(), "peer joined");
        counter!("mesh_road_peers_joined_total", 1);
        self.broadcast();
        Membership { peer_id, messages }
    }

    fn leave(&mut self, peer_id: &PeerId) {
        if self.members.remove(peer_id).is_none() {
            return;
        }
        self.version += 1;
        info!(peer = %peer_id, version = self.version, peers = self.members.len(), "peer left");
        counter!("mesh_road_peers_left_total", 1);
        self.broadcast();
    }

    fn relay(&mut self, from: PeerId, to: PeerId, msg: Value) -> Result<(), RelayError> {
        if !self.members.contains_key(&from) {
            counter!("mesh_road_envelopes_dropped_total", 1, "reason" => "sender_missing");
            return Err(RelayError::SenderMissing(from));
        }
        let Some(recipient) = self.members.get(&to) else {
            debug!(from = %from, to = %to, "dropping envelope for missing recipient");
            counter!("mesh_road_envelopes_dropped_total", 1, "reason" => "recipient_missing");
            return Err(RelayError::RecipientMissing(to));
        };
        if recipient
            .tx
            .send(ServerMessage::Webrtc { from, msg })
            .is_err()
        {
            counter!("mesh_road_envelopes_dropped_total", 1, "reason" => "recipient_missing");
            return Err(RelayError::RecipientMissing(to));
        }
        counter!("mesh_road_envelopes_relayed_total", 1);
        Ok(())
    }

    fn evict_stale(&mut self, timeout: Duration) {
        let stale: Vec<PeerId> = self
            .members
            .iter()
            .filter(|(_, member)| member.last_seen.elapsed() > timeout)
            .map(|(peer_id, _)| peer_id.clone())
            .collect();
        for peer_id in stale {
            info!(peer = %peer_id, "removing stale peer (heartbeat timeout)");
            self.leave(&peer_id);
        }
    }

    fn presence(&self) -> PresenceState {
        PresenceState::new(self.members.keys().cloned(), self.version)
    }

    fn broadcast(&self) {
        gauge!("mesh_road_peers_active", self.members.len() as f64);
        let update = ServerMessage::update(&self.presence());
        for member in self.members.values() {
            let _ = member.tx.send(update.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> Registry {
        Registry::spawn(RegistryConfig {
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_timeout: Duration::ZERO,
        })
    }

    async fn next(membership: &mut Membership) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(1), membership.messages.recv())
            .await
            .expect("no frame within a second")
            .expect("membership channel closed")
    }

    fn update_of(message: ServerMessage) -> (Vec<PeerId>, u64) {
        match message {
            ServerMessage::Update { peers, version } => (peers, version),
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn join_sends_welcome_then_full_roster() {
        let registry = registry();
        let mut alice = registry.join().await.unwrap();

        match next(&mut alice).await {
            ServerMessage::Welcome { peer_id } => assert_eq!(peer_id, alice.peer_id),
            other => panic!("expected welcome, got {other:?}"),
        }
        let (peers, version) = update_of(next(&mut alice).await);
        assert_eq!(peers, vec![alice.peer_id.clone()]);
        assert_eq!(version, 1);

        let mut bob = registry.join().await.unwrap();
        let (peers, version) = update_of(next(&mut alice).await);
        assert_eq!(version, 2);
        assert!(peers.contains(&bob.peer_id));

        next(&mut bob).await;
        let (bob_view, bob_version) = update_of(next(&mut bob).await);
        assert_eq!(bob_version, 2);
        assert_eq!(bob_view, peers);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn leave_broadcasts_and_unknown_leave_is_silent() {
        let registry = registry();
        let mut alice = registry.join().await.unwrap();
        let bob = registry.join().await.unwrap();
        next(&mut alice).await;
        next(&mut alice).await;
        next(&mut alice).await;

        registry.leave(&bob.peer_id);
        let (peers, version) = update_of(next(&mut alice).await);
        assert_eq!(peers, vec![alice.peer_id.clone()]);
        assert_eq!(version, 3);

        registry.leave(&bob.peer_id);
        registry.leave(&PeerId::from("nobody"));
        let presence = registry.presence().await.unwrap();
        assert_eq!(presence.version, 3);
        assert!(alice.messages.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn relay_stamps_sender_and_keeps_order() {
        let registry = registry();
        let alice = registry.join().await.unwrap();
        let mut bob = registry.join().await.unwrap();
        next(&mut bob).await;
        next(&mut bob).await;

        for seq in 0..5 {
            registry
                .relay(&alice.peer_id, bob.peer_id.clone(), json!({ "seq": seq }))
                .await
                .unwrap();
        }
        for seq in 0..5 {
            match next(&mut bob).await {
                ServerMessage::Webrtc { from, msg } => {
                    assert_eq!(from, alice.peer_id);
                    assert_eq!(msg, json!({ "seq": seq }));
                }
                other => panic!("expected relayed envelope, got {other:?}"),
            }
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn relay_to_missing_recipient_is_reported() {
        let registry = registry();
        let alice = registry.join().await.unwrap();
        let ghost = PeerId::from("ghost");

        let result = registry
            .relay(&alice.peer_id, ghost.clone(), json!({}))
            .await;
        assert_eq!(result, Err(RelayError::RecipientMissing(ghost)));

        registry.leave(&alice.peer_id);
        let result = registry
            .relay(&alice.peer_id, PeerId::from("x"), json!({}))
            .await;
        assert_eq!(result, Err(RelayError::SenderMissing(alice.peer_id.clone())));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn versions_strictly_increase() {
        let registry = registry();
        let mut watcher = registry.join().await.unwrap();
        next(&mut watcher).await;
        let mut last = update_of(next(&mut watcher).await).1;

        for _ in 0..3 {
            let other = registry.join().await.unwrap();
            registry.leave(&other.peer_id);
        }
        for _ in 0..6 {
            let version = update_of(next(&mut watcher).await).1;
            assert!(version > last);
            last = version;
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn silent_peers_are_evicted() {
        let registry = Registry::spawn(RegistryConfig {
            heartbeat_interval: Duration::from_millis(20),
            heartbeat_timeout: Duration::from_millis(150),
        });
        let mut chatty = registry.join().await.unwrap();
        let mut silent = registry.join().await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            registry.heartbeat(&chatty.peer_id);
            let presence = registry.presence().await.unwrap();
            if !presence.contains(&silent.peer_id) {
                assert!(presence.contains(&chatty.peer_id));
                break;
            }
            assert!(Instant::now() < deadline, "silent peer never evicted");
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        while silent.messages.recv().await.is_some() {}
        let mut saw_pong = false;
        while let Ok(message) = chatty.messages.try_recv() {
            saw_pong |= matches!(message, ServerMessage::Pong);
        }
        assert!(saw_pong);
    }
}
