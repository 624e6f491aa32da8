//! Call lifecycle and membership handling.
//!
//! A [`RoomCoordinator`] runs as one tokio task. UI commands, relay frames and
//! relay link changes arrive on its inbox; transport callbacks arrive on a
//! second queue tagged with the session generation. Everything is handled on
//! that single task, so registry and session state only change between
//! suspension points of one handler at a time.
//!
//! Offer and answer steps for each peer are awaited inline on that task, so a
//! slow transport call for one peer delays handling for the others. With
//! webrtc-rs these calls are local and short.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::{InitiatorPolicy, RoomConfig};
use crate::error::{CallError, NegotiationError};
use crate::media::{LocalMediaController, LocalStream, MediaDevices};
use crate::peer::{
    LinkState, PeerRegistry, PeerSession, PeerView, Role, SessionSignal, TransportEvent,
    TransportEvents, TransportFactory,
};
use crate::protocol::{ClientEvent, EventKind, PeerId, RelayEvent};
use crate::signaling::{ConnectionState, SignalingChannel, Subscription};

/// How long a closing relay link may take to write the final `leave-room`.
const LEAVE_FLUSH_GRACE: Duration = Duration::from_millis(500);
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Everything the UI renders.
#[derive(Debug, Clone, Default)]
pub struct RoomSnapshot {
    pub in_call: bool,
    pub connected: bool,
    pub local: Option<LocalStream>,
    pub peers: Vec<PeerView>,
}

enum Command {
    StartCall(oneshot::Sender<Result<LocalStream, CallError>>),
    EndCall(oneshot::Sender<()>),
    Relay { call: u64, event: RelayEvent },
    Link { call: u64, state: ConnectionState },
    Shutdown(Option<oneshot::Sender<()>>),
}

struct HandleInner {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<RoomSnapshot>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown(None));
    }
}

/// Cheap clonable handle to a running coordinator. When the last clone is
/// dropped the coordinator ends the call and exits.
#[derive(Clone)]
pub struct RoomHandle {
    inner: Arc<HandleInner>,
}

impl RoomHandle {
    /// Acquires local media, opens the relay link and joins the room. On a
    /// media error nothing is sent and the room stays idle. Calling it while
    /// already in a call returns the current local stream.
    pub async fn start_call(&self) -> Result<LocalStream, CallError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .commands
            .send(Command::StartCall(tx))
            .map_err(|_| CallError::Shutdown)?;
        rx.await.map_err(|_| CallError::Shutdown)?
    }

    /// Idempotent; a no-op when no call is active or the coordinator is gone.
    pub async fn end_call(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.commands.send(Command::EndCall(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RoomSnapshot> {
        self.inner.snapshot.clone()
    }

    /// Ends the call and waits for the coordinator task to exit.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.commands.send(Command::Shutdown(Some(tx))).is_ok() {
            let _ = rx.await;
        }
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// The relay link of one call, with everything needed to unwind it.
struct CallLink {
    channel: SignalingChannel,
    subscriptions: Vec<Subscription>,
    state_forwarder: JoinHandle<()>,
}

pub struct RoomCoordinator {
    config: RoomConfig,
    media: LocalMediaController,
    factory: Arc<dyn TransportFactory>,
    registry: PeerRegistry,
    link: Option<CallLink>,
    call: u64,
    links_seen: u64,
    in_call: bool,
    connected: bool,
    commands_tx: mpsc::UnboundedSender<Command>,
    signals_tx: mpsc::UnboundedSender<SessionSignal>,
    snapshot_tx: watch::Sender<RoomSnapshot>,
}

impl RoomCoordinator {
    /// Starts the coordinator task on the current runtime.
    pub fn spawn(
        config: RoomConfig,
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn TransportFactory>,
    ) -> RoomHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(RoomSnapshot::default());

        let media = LocalMediaController::new(devices, config.constraints);
        let coordinator = RoomCoordinator {
            config,
            media,
            factory,
            registry: PeerRegistry::new(),
            link: None,
            call: 0,
            links_seen: 0,
            in_call: false,
            connected: false,
            commands_tx: commands_tx.clone(),
            signals_tx,
            snapshot_tx,
        };
        let task = tokio::spawn(coordinator.run(commands_rx, signals_rx));

        RoomHandle {
            inner: Arc::new(HandleInner {
                commands: commands_tx,
                snapshot: snapshot_rx,
                task: Mutex::new(Some(task)),
            }),
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signals: mpsc::UnboundedReceiver<SessionSignal>,
    ) {
        let sweep_every = self
            .config
            .negotiation_timeout
            .map(|limit| (limit / 4).max(MIN_SWEEP_INTERVAL))
            .unwrap_or(Duration::from_secs(3600));
        let mut sweep = tokio::time::interval(sweep_every);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::debug!(target: "lagoon::room", room = %self.config.room, "room coordinator started");
        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Shutdown(ack)) => {
                            self.end_call().await;
                            self.publish();
                            if let Some(ack) = ack {
                                let _ = ack.send(());
                            }
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            self.end_call().await;
                            break;
                        }
                    }
                }
                Some(signal) = signals.recv() => self.handle_signal(signal).await,
                _ = sweep.tick(), if self.config.negotiation_timeout.is_some() => {
                    self.reap_stalled().await;
                }
            }
            self.publish();
        }
        tracing::debug!(target: "lagoon::room", room = %self.config.room, "room coordinator stopped");
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(RoomSnapshot {
            in_call: self.in_call,
            connected: self.connected,
            local: self.media.stream().cloned(),
            peers: self.registry.peers(),
        });
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartCall(reply) => {
                let result = self.start_call().await;
                let _ = reply.send(result);
            }
            Command::EndCall(reply) => {
                self.end_call().await;
                let _ = reply.send(());
            }
            Command::Relay { call, event } => {
                if call == self.call && self.in_call {
                    self.handle_relay(event).await;
                }
            }
            Command::Link { call, state } => {
                if call == self.call && self.in_call {
                    self.handle_link(state).await;
                }
            }
            Command::Shutdown(_) => {}
        }
    }

    async fn start_call(&mut self) -> Result<LocalStream, CallError> {
        if self.in_call {
            if let Some(stream) = self.media.stream() {
                return Ok(stream.clone());
            }
        }
        let stream = match self.media.acquire().await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(
                    target: "lagoon::room",
                    room = %self.config.room,
                    error = %err,
                    "local media unavailable; call not started"
                );
                return Err(err.into());
            }
        };

        let channel =
            match SignalingChannel::connect(&self.config.signaling_url, self.config.reconnect) {
                Ok(channel) => channel,
                Err(err) => {
                    self.media.release();
                    return Err(err.into());
                }
            };

        self.call += 1;
        self.links_seen = 0;
        let call = self.call;
        let subscriptions = EventKind::ALL
            .into_iter()
            .map(|kind| {
                let commands = self.commands_tx.clone();
                channel.on(kind, move |event| {
                    let _ = commands.send(Command::Relay {
                        call,
                        event: event.clone(),
                    });
                })
            })
            .collect();
        let state_forwarder = tokio::spawn(forward_link_state(
            channel.state(),
            self.commands_tx.clone(),
            call,
        ));
        self.link = Some(CallLink {
            channel,
            subscriptions,
            state_forwarder,
        });

        self.in_call = true;
        self.send(ClientEvent::JoinRoom {
            room: self.config.room.clone(),
        });
        tracing::info!(
            target: "lagoon::room",
            room = %self.config.room,
            stream_id = %stream.id(),
            "call started"
        );
        Ok(stream)
    }

    async fn end_call(&mut self) {
        if !self.in_call {
            return;
        }
        self.in_call = false;
        let closed = self.registry.clear().await;
        self.media.release();

        if let Some(link) = self.link.take() {
            if let Err(err) = link.channel.emit(ClientEvent::LeaveRoom {
                room: self.config.room.clone(),
            }) {
                tracing::debug!(target: "lagoon::room", error = %err, "leave-room not sent");
            }
            for subscription in link.subscriptions {
                link.channel.off(subscription);
            }
            link.state_forwarder.abort();
            link.channel.close_after_flush(LEAVE_FLUSH_GRACE);
        }
        self.connected = false;
        tracing::info!(
            target: "lagoon::room",
            room = %self.config.room,
            closed_sessions = closed,
            "call ended"
        );
    }

    fn send(&self, event: ClientEvent) {
        let Some(link) = &self.link else {
            return;
        };
        if let Err(err) = link.channel.emit(event) {
            tracing::warn!(target: "lagoon::room", error = %err, "signaling emit failed");
        }
    }

    async fn handle_link(&mut self, state: ConnectionState) {
        let was_connected = self.connected;
        self.connected = state.is_connected();
        match state {
            ConnectionState::Connected => {
                self.links_seen += 1;
                if self.links_seen > 1 {
                    // The relay assigns a fresh id per connection, so every
                    // remote peer already dropped our old identity.
                    let closed = self.registry.clear().await;
                    tracing::info!(
                        target: "lagoon::room",
                        room = %self.config.room,
                        closed_sessions = closed,
                        "relay link restored; rejoining room"
                    );
                    self.send(ClientEvent::JoinRoom {
                        room: self.config.room.clone(),
                    });
                }
            }
            ConnectionState::Disconnected if was_connected => {
                tracing::warn!(
                    target: "lagoon::room",
                    room = %self.config.room,
                    "relay link lost; reconnecting"
                );
            }
            _ => {}
        }
    }

    fn is_self(&self, peer_id: &str) -> bool {
        self.config.local_id.as_deref() == Some(peer_id)
    }

    async fn handle_relay(&mut self, event: RelayEvent) {
        if let Some(room) = event.room() {
            if room != self.config.room {
                tracing::debug!(
                    target: "lagoon::room",
                    room = %room,
                    event = %event.kind(),
                    "dropping frame for another room"
                );
                return;
            }
        }
        match event {
            RelayEvent::AllUsers(peer_ids) => {
                let role = match self.config.initiator_policy {
                    InitiatorPolicy::Newcomer => Role::Initiator,
                    InitiatorPolicy::Incumbent => Role::Responder,
                };
                for peer_id in peer_ids {
                    self.add_peer(peer_id, role).await;
                }
            }
            RelayEvent::UserJoined(peer_id) => {
                let role = match self.config.initiator_policy {
                    InitiatorPolicy::Newcomer => Role::Responder,
                    InitiatorPolicy::Incumbent => Role::Initiator,
                };
                self.add_peer(peer_id, role).await;
            }
            RelayEvent::UserLeft(peer_id) => {
                if self.registry.remove(&peer_id).await {
                    tracing::info!(target: "lagoon::room", peer_id = %peer_id, "peer left");
                }
            }
            RelayEvent::Offer { from, offer, .. } => {
                if self.is_self(&from) {
                    return;
                }
                if !self.registry.contains(&from) {
                    tracing::debug!(
                        target: "lagoon::room",
                        peer_id = %from,
                        "offer from unannounced peer"
                    );
                    self.add_peer(from.clone(), Role::Responder).await;
                }
                let Some(peer) = self.registry.get_mut(&from) else {
                    return;
                };
                match peer.session_mut().accept_offer(offer, &self.media).await {
                    Ok(Some(answer)) => self.send(ClientEvent::Answer {
                        to: from,
                        answer,
                        room: self.config.room.clone(),
                    }),
                    Ok(None) => {}
                    Err(err) => self.fail_peer(&from, err).await,
                }
            }
            RelayEvent::Answer { from, answer, .. } => {
                let Some(peer) = self.registry.get_mut(&from) else {
                    tracing::debug!(target: "lagoon::room", peer_id = %from, "answer for unknown peer");
                    return;
                };
                if let Err(err) = peer.session_mut().accept_answer(answer).await {
                    self.fail_peer(&from, err).await;
                }
            }
            RelayEvent::IceCandidate { from, candidate, .. } => {
                match self.registry.get_mut(&from) {
                    Some(peer) => peer.session_mut().add_remote_candidate(candidate).await,
                    None => tracing::debug!(
                        target: "lagoon::room",
                        peer_id = %from,
                        "candidate for unknown peer"
                    ),
                }
            }
        }
    }

    /// Creates the session for a newly seen participant. Duplicate ids and
    /// our own id are ignored.
    async fn add_peer(&mut self, peer_id: PeerId, role: Role) {
        if self.is_self(&peer_id) || self.registry.contains(&peer_id) {
            return;
        }
        let generation = self.registry.next_generation();
        let events = TransportEvents::new(peer_id.clone(), generation, self.signals_tx.clone());
        let transport = match self.factory.create(&peer_id, events).await {
            Ok(transport) => transport,
            Err(err) => {
                tracing::warn!(
                    target: "lagoon::room",
                    peer_id = %peer_id,
                    error = %err,
                    "could not create transport for peer"
                );
                return;
            }
        };
        let session = PeerSession::new(peer_id.clone(), generation, role, transport);
        if let Err(mut rejected) = self.registry.try_insert(session) {
            rejected.close().await;
            return;
        }
        tracing::info!(
            target: "lagoon::room",
            peer_id = %peer_id,
            generation,
            ?role,
            "peer added"
        );

        if role != Role::Initiator {
            return;
        }
        let Some(peer) = self.registry.get_mut(&peer_id) else {
            return;
        };
        match peer.session_mut().start_offer(&self.media).await {
            Ok(Some(offer)) => self.send(ClientEvent::Offer {
                to: peer_id,
                offer,
                room: self.config.room.clone(),
            }),
            Ok(None) => {}
            Err(err) => self.fail_peer(&peer_id, err).await,
        }
    }

    async fn fail_peer(&mut self, peer_id: &str, err: NegotiationError) {
        tracing::warn!(
            target: "lagoon::room",
            peer_id = %peer_id,
            error = %err,
            "negotiation failed; dropping peer"
        );
        self.registry.remove(peer_id).await;
    }

    async fn handle_signal(&mut self, signal: SessionSignal) {
        let SessionSignal {
            peer_id,
            generation,
            event,
        } = signal;
        let Some(session) = self.registry.session_mut(&peer_id, generation) else {
            tracing::trace!(
                target: "lagoon::room",
                peer_id = %peer_id,
                generation,
                "ignoring callback from a retired session"
            );
            return;
        };
        if session.is_closed() {
            return;
        }
        match event {
            TransportEvent::LocalCandidate(candidate) => self.send(ClientEvent::IceCandidate {
                to: peer_id,
                candidate,
                room: self.config.room.clone(),
            }),
            TransportEvent::Track(track) => {
                session.on_remote_track(track);
            }
            TransportEvent::Link(state) => match state {
                LinkState::Failed | LinkState::Disconnected => tracing::info!(
                    target: "lagoon::room",
                    peer_id = %peer_id,
                    ?state,
                    "peer link degraded"
                ),
                _ => tracing::debug!(
                    target: "lagoon::room",
                    peer_id = %peer_id,
                    ?state,
                    "peer link state"
                ),
            },
        }
    }

    async fn reap_stalled(&mut self) {
        let Some(limit) = self.config.negotiation_timeout else {
            return;
        };
        for (peer_id, generation) in self.registry.stalled(limit) {
            if self.registry.session_mut(&peer_id, generation).is_some() {
                self.fail_peer(&peer_id, NegotiationError::TimedOut(limit)).await;
            }
        }
    }
}

async fn forward_link_state(
    mut state: watch::Receiver<ConnectionState>,
    commands: mpsc::UnboundedSender<Command>,
    call: u64,
) {
    loop {
        let current = *state.borrow_and_update();
        if commands
            .send(Command::Link {
                call,
                state: current,
            })
            .is_err()
        {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}
