//! Websocket link to the signaling relay.
//!
//! The channel owns no call semantics: it dials the relay, keeps redialing
//! when the link drops, writes queued [`ClientEvent`]s and fans decoded
//! [`RelayEvent`]s out to subscribers.

mod backoff;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError as WsProtocolError},
};
use url::Url;

use crate::error::SignalingError;
use crate::protocol::{ClientEvent, EventKind, RelayEvent};

pub use backoff::ReconnectPolicy;
use backoff::Backoff;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

type Handler = Arc<dyn Fn(&RelayEvent) + Send + Sync>;

/// Returned by [`SignalingChannel::on`]; pass it to [`SignalingChannel::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    kind: EventKind,
    id: u64,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

struct Shared {
    endpoint: Url,
    handlers: RwLock<HashMap<EventKind, Vec<(u64, Handler)>>>,
    next_subscription: AtomicU64,
    state_tx: watch::Sender<ConnectionState>,
    closed: AtomicBool,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        if self.closed.load(Ordering::SeqCst) && state != ConnectionState::Closed {
            return;
        }
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(
                target: "lagoon::signaling",
                endpoint = %self.endpoint,
                ?previous,
                current = ?state,
                "relay connection state changed"
            );
        }
    }

    fn dispatch(&self, text: &str) {
        let event = match RelayEvent::decode(text) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(
                    target: "lagoon::signaling",
                    error = %err,
                    len = text.len(),
                    "dropping relay frame"
                );
                return;
            }
        };
        let handlers: Vec<Handler> = {
            let guard = self.handlers.read();
            guard
                .get(&event.kind())
                .map(|entries| entries.iter().map(|(_, handler)| Arc::clone(handler)).collect())
                .unwrap_or_default()
        };
        if handlers.is_empty() {
            tracing::trace!(
                target: "lagoon::signaling",
                event = %event.kind(),
                "no subscribers for relay event"
            );
        }
        for handler in handlers {
            handler(&event);
        }
    }
}

pub struct SignalingChannel {
    shared: Arc<Shared>,
    outbound_tx: Mutex<Option<mpsc::UnboundedSender<ClientEvent>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingChannel {
    /// Starts dialing `endpoint` in the background and returns immediately.
    /// The link is redialed forever until [`close`](Self::close).
    pub fn connect(endpoint: &str, policy: ReconnectPolicy) -> Result<Self, SignalingError> {
        let endpoint = websocket_url(endpoint)?;
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            endpoint,
            handlers: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            state_tx,
            closed: AtomicBool::new(false),
        });
        let supervisor = tokio::spawn(supervise(Arc::clone(&shared), outbound_rx, policy));
        Ok(Self {
            shared,
            outbound_tx: Mutex::new(Some(outbound_tx)),
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.shared.endpoint
    }

    /// Queues a frame for the relay. There is no acknowledgement; a frame that
    /// is in flight when the link drops is lost.
    pub fn emit(&self, event: ClientEvent) -> Result<(), SignalingError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(SignalingError::Closed);
        }
        let guard = self.outbound_tx.lock();
        let tx = guard.as_ref().ok_or(SignalingError::Closed)?;
        tx.send(event).map_err(|_| SignalingError::Closed)
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&RelayEvent) + Send + Sync + 'static,
    {
        let id = self.shared.next_subscription.fetch_add(1, Ordering::SeqCst);
        self.shared
            .handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription { kind, id }
    }

    pub fn off(&self, subscription: Subscription) {
        let mut guard = self.shared.handlers.write();
        if let Some(entries) = guard.get_mut(&subscription.kind) {
            entries.retain(|(id, _)| *id != subscription.id);
            if entries.is_empty() {
                guard.remove(&subscription.kind);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.handlers.read().values().map(Vec::len).sum()
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Stops immediately. Queued frames that were not written yet are lost.
    pub fn close(&self) {
        if !self.mark_closed() {
            return;
        }
        self.outbound_tx.lock().take();
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
        tracing::debug!(
            target: "lagoon::signaling",
            endpoint = %self.shared.endpoint,
            "signaling channel closed"
        );
    }

    /// Stops accepting frames but gives the live link up to `grace` to write
    /// what is already queued, e.g. a final `leave-room`.
    pub fn close_after_flush(&self, grace: Duration) {
        if !self.mark_closed() {
            return;
        }
        self.outbound_tx.lock().take();
        let Some(mut handle) = self.supervisor.lock().take() else {
            return;
        };
        let endpoint = self.shared.endpoint.clone();
        tokio::spawn(async move {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                handle.abort();
                tracing::debug!(
                    target: "lagoon::signaling",
                    endpoint = %endpoint,
                    "flush grace elapsed; dropping queued frames"
                );
            }
        });
    }

    fn mark_closed(&self) -> bool {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shared.handlers.write().clear();
        self.shared.set_state(ConnectionState::Closed);
        true
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn supervise(
    shared: Arc<Shared>,
    mut outbound: mpsc::UnboundedReceiver<ClientEvent>,
    policy: ReconnectPolicy,
) {
    let mut backoff = Backoff::new(policy);
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        shared.set_state(ConnectionState::Connecting);
        match connect_async(shared.endpoint.as_str()).await {
            Ok((stream, _)) => {
                backoff.reset();
                tracing::info!(
                    target: "lagoon::signaling",
                    endpoint = %shared.endpoint,
                    attempt,
                    "relay connected"
                );
                shared.set_state(ConnectionState::Connected);
                let finished = pump(&shared, stream, &mut outbound).await;
                shared.set_state(ConnectionState::Disconnected);
                if finished || shared.closed.load(Ordering::SeqCst) {
                    return;
                }
                attempt = 0;
            }
            Err(err) => {
                tracing::warn!(
                    target: "lagoon::signaling",
                    endpoint = %shared.endpoint,
                    attempt,
                    error = %err,
                    "relay connect failed"
                );
                shared.set_state(ConnectionState::Disconnected);
                if shared.closed.load(Ordering::SeqCst) {
                    return;
                }
            }
        }
        let delay = backoff.next_delay();
        tracing::debug!(
            target: "lagoon::signaling",
            delay_ms = delay.as_millis() as u64,
            "scheduling relay reconnect"
        );
        tokio::time::sleep(delay).await;
    }
}

fn encode_frame(event: &ClientEvent) -> Result<String, SignalingError> {
    event.encode().map_err(SignalingError::Encode)
}

/// Runs one live connection. Returns `true` once the outbound queue is gone
/// and nothing is left to reconnect for.
async fn pump(
    shared: &Shared,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    outbound: &mut mpsc::UnboundedReceiver<ClientEvent>,
) -> bool {
    let (mut write, mut read) = stream.split();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            next = outbound.recv() => {
                let Some(event) = next else {
                    let _ = write.close().await;
                    return true;
                };
                let text = match encode_frame(&event) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(target: "lagoon::signaling", error = %err, "dropping outbound frame");
                        continue;
                    }
                };
                tracing::trace!(target: "lagoon::signaling", event = "ws_out", len = text.len());
                if let Err(err) = write.send(Message::Text(text)).await {
                    tracing::warn!(
                        target: "lagoon::signaling",
                        error = %err,
                        "relay write failed; frame lost"
                    );
                    return false;
                }
            }
            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        tracing::trace!(target: "lagoon::signaling", event = "ws_in", kind = "text", len = text.len());
                        shared.dispatch(&text);
                    }
                    Some(Ok(Message::Binary(data))) => {
                        tracing::trace!(target: "lagoon::signaling", event = "ws_in", kind = "binary", len = data.len());
                        match String::from_utf8(data) {
                            Ok(text) => shared.dispatch(&text),
                            Err(_) => tracing::warn!(target: "lagoon::signaling", "dropping non-utf8 relay frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::debug!(target: "lagoon::signaling", "relay closed the connection");
                        return false;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target: "lagoon::signaling", "relay websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target: "lagoon::signaling", "relay websocket error: {err}");
                            }
                        }
                        return false;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if write.send(Message::Ping(Vec::new())).await.is_err() {
                    tracing::debug!(target: "lagoon::signaling", "heartbeat failed");
                    return false;
                }
            }
        }
    }
}

fn websocket_url(endpoint: &str) -> Result<Url, SignalingError> {
    let invalid = |reason: &str| SignalingError::InvalidUrl {
        url: endpoint.to_string(),
        reason: reason.to_string(),
    };
    let mut url = Url::parse(endpoint).map_err(|err| invalid(&err.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(invalid(&format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid("cannot convert to websocket scheme"))?;
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn maps_http_schemes_to_websocket() {
        assert_eq!(
            websocket_url("http://relay.local:5000/signal").unwrap().as_str(),
            "ws://relay.local:5000/signal"
        );
        assert_eq!(
            websocket_url("https://relay.example.com/ws#x").unwrap().as_str(),
            "wss://relay.example.com/ws"
        );
        assert!(matches!(
            websocket_url("ftp://relay"),
            Err(SignalingError::InvalidUrl { .. })
        ));
        assert!(websocket_url("not a url").is_err());
    }

    #[tokio::test]
    async fn off_removes_only_the_given_handler() {
        // Port 9 is discard; the supervisor just keeps failing to dial.
        let channel = SignalingChannel::connect("ws://127.0.0.1:9/", ReconnectPolicy::default())
            .unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let first = {
            let hits = Arc::clone(&hits);
            channel.on(EventKind::UserJoined, move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        let _second = {
            let hits = Arc::clone(&hits);
            channel.on(EventKind::UserJoined, move |_| {
                hits.fetch_add(10, Ordering::SeqCst);
            })
        };
        assert_eq!(channel.subscriber_count(), 2);

        channel.shared.dispatch(r#"{"event":"user-joined","data":"b"}"#);
        assert_eq!(hits.load(Ordering::SeqCst), 11);

        channel.off(first);
        channel.off(first);
        channel.shared.dispatch(r#"{"event":"user-joined","data":"c"}"#);
        assert_eq!(hits.load(Ordering::SeqCst), 21);
        assert_eq!(channel.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn malformed_frames_never_reach_handlers() {
        let channel = SignalingChannel::connect("ws://127.0.0.1:9/", ReconnectPolicy::default())
            .unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        for kind in EventKind::ALL {
            let hits = Arc::clone(&hits);
            channel.on(kind, move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        channel.shared.dispatch(r#"{"event":"user_count","data":[]}"#);
        channel.shared.dispatch(r#"{"event":"answer","data":{}}"#);
        channel.shared.dispatch("{");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn outbound_frames_encode_as_event_and_data() {
        let text = encode_frame(&ClientEvent::JoinRoom {
            room: "lobby".into(),
        })
        .unwrap();
        let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(frame["event"], "join-room");
        assert_eq!(frame["data"]["room"], "lobby");

        let err = SignalingError::Encode(serde_json::from_str::<u8>("x").unwrap_err());
        assert!(err.to_string().starts_with("failed to encode signaling frame"));
    }

    #[tokio::test]
    async fn close_rejects_emits_and_reports_closed() {
        let channel = SignalingChannel::connect("ws://127.0.0.1:9/", ReconnectPolicy::default())
            .unwrap();
        channel.on(EventKind::UserLeft, |_| {});
        channel.close();
        assert_eq!(channel.current_state(), ConnectionState::Closed);
        assert_eq!(channel.subscriber_count(), 0);
        let result = channel.emit(ClientEvent::LeaveRoom {
            room: "lobby".into(),
        });
        assert!(matches!(result, Err(SignalingError::Closed)));
    }
}
