use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::media::{LocalTrack, RemoteTrack};
use crate::protocol::{IceCandidate, PeerId, SessionDescription};

/// Connectivity of the underlying peer connection as reported by the media
/// stack. Informational; session state is driven by signaling and tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug)]
pub enum TransportEvent {
    /// A candidate gathered locally that must reach the remote peer.
    LocalCandidate(IceCandidate),
    Track(RemoteTrack),
    Link(LinkState),
}

/// A transport callback routed back to the coordinator. `generation` ties it
/// to one specific session so late callbacks from a torn-down connection can
/// be told apart from the peer's current one.
#[derive(Debug)]
pub struct SessionSignal {
    pub peer_id: PeerId,
    pub generation: u64,
    pub event: TransportEvent,
}

#[derive(Debug, Clone)]
pub struct TransportEvents {
    peer_id: PeerId,
    generation: u64,
    tx: mpsc::UnboundedSender<SessionSignal>,
}

impl TransportEvents {
    pub fn new(
        peer_id: impl Into<PeerId>,
        generation: u64,
        tx: mpsc::UnboundedSender<SessionSignal>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            generation,
            tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` once the coordinator is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(SessionSignal {
                peer_id: self.peer_id.clone(),
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// The negotiated media link to one remote participant.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), TransportError>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription)
    -> Result<(), TransportError>;

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        peer_id: &str,
        events: TransportEvents,
    ) -> Result<Box<dyn PeerTransport>, TransportError>;
}
