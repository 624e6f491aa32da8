//! In-process signaling relay and scripted peers for coordinator scenarios.
//!
//! The relay speaks the same `{"event", "data"}` framing as the production
//! relay: it assigns ids in connect order, answers `join-room` with
//! `all-users` and announces the joiner to everyone else, and forwards
//! peer-addressed frames with `to` rewritten to `from`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use lagoon::RoomConfig;
use lagoon::media::SampleDevices;
use lagoon::peer::mock::MockTransportFactory;
use lagoon::room::{RoomCoordinator, RoomHandle, RoomSnapshot};
use lagoon::signaling::ReconnectPolicy;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

pub const WAIT: Duration = Duration::from_secs(5);
pub const ROOM: &str = "lobby";

/// A frame the relay received from one of its clients.
#[derive(Debug, Clone)]
pub struct Frame {
    pub from: String,
    pub event: String,
    pub data: Value,
}

impl Frame {
    pub fn to(&self) -> Option<&str> {
        self.data.get("to").and_then(Value::as_str)
    }
}

enum Outbound {
    Text(String),
    Close,
}

struct Client {
    tx: mpsc::UnboundedSender<Outbound>,
    room: Option<String>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    clients: HashMap<String, Client>,
    rooms: HashMap<String, Vec<String>>,
    log: Vec<Frame>,
    /// Include the joiner itself in its own membership events, as some
    /// relays do.
    echo_self: bool,
}

impl Inner {
    fn send(&self, to: &str, event: &str, data: Value) {
        if let Some(client) = self.clients.get(to) {
            let frame = json!({ "event": event, "data": data }).to_string();
            let _ = client.tx.send(Outbound::Text(frame));
        }
    }

    fn join(&mut self, id: &str, room: &str) {
        self.leave(id);
        let members = self.rooms.entry(room.to_string()).or_default();
        let existing = members.clone();
        members.push(id.to_string());
        let everyone = members.clone();
        if let Some(client) = self.clients.get_mut(id) {
            client.room = Some(room.to_string());
        }
        if self.echo_self {
            self.send(id, "all-users", json!(everyone));
            for member in &everyone {
                self.send(member, "user-joined", json!(id));
            }
        } else {
            self.send(id, "all-users", json!(existing));
            for other in &existing {
                self.send(other, "user-joined", json!(id));
            }
        }
    }

    fn leave(&mut self, id: &str) {
        let Some(room) = self.clients.get_mut(id).and_then(|client| client.room.take()) else {
            return;
        };
        let remaining = match self.rooms.get_mut(&room) {
            Some(members) => {
                members.retain(|member| member != id);
                members.clone()
            }
            None => return,
        };
        for other in &remaining {
            self.send(other, "user-left", json!(id));
        }
    }

    fn forward(&self, from: &str, event: &str, mut data: Value) {
        let Some(to) = data.get("to").and_then(Value::as_str).map(str::to_string) else {
            return;
        };
        if let Some(object) = data.as_object_mut() {
            object.remove("to");
            object.insert("from".into(), json!(from));
        }
        self.send(&to, event, data);
    }
}

#[derive(Clone, Default)]
struct RelayState {
    inner: Arc<Mutex<Inner>>,
}

pub struct Relay {
    addr: SocketAddr,
    state: RelayState,
    server: JoinHandle<()>,
}

impl Relay {
    pub async fn start() -> Relay {
        Self::serve(RelayState::default()).await
    }

    /// A relay that echoes membership events back to the joiner.
    pub async fn start_echoing() -> Relay {
        let state = RelayState::default();
        state.inner.lock().echo_self = true;
        Self::serve(state).await
    }

    async fn serve(state: RelayState) -> Relay {
        let app = Router::new()
            .route("/ws", get(upgrade))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Relay {
            addr,
            state,
            server,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.state.inner.lock().log.clone()
    }

    pub fn frames_named(&self, event: &str) -> Vec<Frame> {
        self.frames()
            .into_iter()
            .filter(|frame| frame.event == event)
            .collect()
    }

    /// Room members in join order.
    pub fn members(&self, room: &str) -> Vec<String> {
        self.state
            .inner
            .lock()
            .rooms
            .get(room)
            .cloned()
            .unwrap_or_default()
    }

    /// Drops every live connection as if the relay had restarted.
    pub fn disconnect_all(&self) {
        let mut inner = self.state.inner.lock();
        let ids: Vec<String> = inner.clients.keys().cloned().collect();
        for id in ids {
            inner.leave(&id);
            if let Some(client) = inner.clients.remove(&id) {
                let _ = client.tx.send(Outbound::Close);
            }
        }
    }

    /// Drops one client's connection; everyone else stays connected.
    pub fn disconnect(&self, id: &str) {
        let mut inner = self.state.inner.lock();
        inner.leave(id);
        if let Some(client) = inner.clients.remove(id) {
            let _ = client.tx.send(Outbound::Close);
        }
    }

    pub async fn wait_members(&self, room: &str, count: usize) -> Vec<String> {
        eventually(&format!("{count} members in {room}"), || {
            let members = self.members(room);
            (members.len() == count).then_some(members)
        })
        .await
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let id = {
        let mut inner = state.inner.lock();
        inner.next_id += 1;
        let id = format!("peer-{}", inner.next_id);
        inner.clients.insert(id.clone(), Client { tx, room: None });
        id
    };

    tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Text(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let event = frame["event"].as_str().unwrap_or_default().to_string();
        let data = frame.get("data").cloned().unwrap_or(Value::Null);

        let mut inner = state.inner.lock();
        if !inner.clients.contains_key(&id) {
            break;
        }
        inner.log.push(Frame {
            from: id.clone(),
            event: event.clone(),
            data: data.clone(),
        });
        match event.as_str() {
            "join-room" => {
                if let Some(room) = data["room"].as_str() {
                    inner.join(&id, room);
                }
            }
            "leave-room" => inner.leave(&id),
            "offer" | "answer" | "ice-candidate" => inner.forward(&id, &event, data),
            _ => {}
        }
    }

    let mut inner = state.inner.lock();
    inner.leave(&id);
    inner.clients.remove(&id);
}

/// Polls `check` until it yields a value or [`WAIT`] runs out.
pub async fn eventually<T>(what: &str, mut check: impl FnMut() -> Option<T>) -> T {
    let polled = timeout(WAIT, async {
        loop {
            if let Some(value) = check() {
                return value;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    match polled {
        Ok(value) => value,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

pub async fn wait_for(
    handle: &RoomHandle,
    what: &str,
    pred: impl FnMut(&RoomSnapshot) -> bool,
) -> RoomSnapshot {
    let mut updates = handle.subscribe();
    let result = timeout(WAIT, updates.wait_for(pred)).await;
    match result {
        Ok(Ok(snapshot)) => snapshot.clone(),
        _ => panic!("timed out waiting for {what}: {:?}", handle.snapshot()),
    }
}

pub fn config(relay: &Relay) -> RoomConfig {
    RoomConfig::new(relay.url(), ROOM).with_reconnect(ReconnectPolicy {
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(200),
    })
}

pub struct TestClient {
    pub handle: RoomHandle,
    pub transports: MockTransportFactory,
}

impl TestClient {
    pub fn spawn(config: RoomConfig) -> TestClient {
        Self::spawn_with(config, SampleDevices::new())
    }

    pub fn spawn_with(config: RoomConfig, devices: SampleDevices) -> TestClient {
        let transports = MockTransportFactory::new();
        let handle =
            RoomCoordinator::spawn(config, Arc::new(devices), Arc::new(transports.clone()));
        TestClient { handle, transports }
    }
}

pub fn connected_peers(snapshot: &RoomSnapshot) -> Vec<String> {
    snapshot
        .peers
        .iter()
        .filter(|peer| peer.stream.is_some())
        .map(|peer| peer.peer_id.clone())
        .collect()
}

/// A bare websocket client that speaks the relay protocol by hand.
pub struct ScriptedPeer {
    ws: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

impl ScriptedPeer {
    pub async fn connect(relay: &Relay) -> ScriptedPeer {
        let (ws, _) = connect_async(relay.url()).await.unwrap();
        ScriptedPeer { ws }
    }

    pub async fn send(&mut self, event: &str, data: Value) {
        let frame = json!({ "event": event, "data": data }).to_string();
        self.ws
            .send(tokio_tungstenite::tungstenite::Message::Text(frame))
            .await
            .unwrap();
    }

    /// Waits for the next frame named `event`, skipping everything else.
    pub async fn expect(&mut self, event: &str) -> Value {
        let next = timeout(WAIT, async {
            while let Some(Ok(message)) = self.ws.next().await {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = message {
                    let frame: Value = serde_json::from_str(&text).unwrap();
                    if frame["event"] == event {
                        return Some(frame["data"].clone());
                    }
                }
            }
            None
        })
        .await;
        match next {
            Ok(Some(data)) => data,
            _ => panic!("scripted peer never received {event}"),
        }
    }
}
