use std::collections::VecDeque;
use std::time::Instant;

use crate::error::{IceApplyWarning, NegotiationError, TransportError};
use crate::media::{LocalMediaController, LocalStream, RemoteStream, RemoteTrack};
use crate::protocol::{IceCandidate, PeerId, SessionDescription};

use super::transport::PeerTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Negotiating,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates and sends the offer.
    Initiator,
    /// Waits for the remote offer and answers it.
    Responder,
}

/// Offer/answer/ICE state machine for one remote participant.
///
/// Every step checks for `Closed` first, so work that completes after the
/// session was torn down has no effect.
pub struct PeerSession {
    peer_id: PeerId,
    generation: u64,
    role: Role,
    state: SessionState,
    transport: Box<dyn PeerTransport>,
    local_tracks_attached: bool,
    offer_sent: bool,
    answer_sent: bool,
    remote_description_set: bool,
    pending_candidates: VecDeque<IceCandidate>,
    remote_tracks: Vec<RemoteTrack>,
    negotiation_started: Option<Instant>,
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("peer_id", &self.peer_id)
            .field("generation", &self.generation)
            .field("role", &self.role)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl PeerSession {
    pub fn new(
        peer_id: impl Into<PeerId>,
        generation: u64,
        role: Role,
        transport: Box<dyn PeerTransport>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            generation,
            role,
            state: SessionState::New,
            transport,
            local_tracks_attached: false,
            offer_sent: false,
            answer_sent: false,
            remote_description_set: false,
            pending_candidates: VecDeque::new(),
            remote_tracks: Vec::new(),
            negotiation_started: None,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn local_tracks_attached(&self) -> bool {
        self.local_tracks_attached
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn negotiation_started(&self) -> Option<Instant> {
        self.negotiation_started
    }

    pub fn remote_stream(&self) -> Option<RemoteStream> {
        RemoteStream::from_tracks(&self.remote_tracks)
    }

    pub(crate) async fn attach_local_tracks(
        &mut self,
        stream: Option<&LocalStream>,
    ) -> Result<usize, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let Some(stream) = stream else {
            return Ok(0);
        };
        if self.local_tracks_attached {
            return Ok(0);
        }
        for track in stream.tracks() {
            self.transport.add_track(track).await?;
        }
        self.local_tracks_attached = true;
        tracing::debug!(
            target: "lagoon::peer",
            peer_id = %self.peer_id,
            tracks = stream.tracks().len(),
            "local tracks attached"
        );
        Ok(stream.tracks().len())
    }

    fn enter_negotiating(&mut self) {
        if self.state == SessionState::New {
            self.state = SessionState::Negotiating;
            self.negotiation_started = Some(Instant::now());
        }
    }

    /// Initiator path: attach tracks, create the offer, install it locally.
    /// Returns the offer to send, or `None` when nothing should be sent.
    pub async fn start_offer(
        &mut self,
        media: &LocalMediaController,
    ) -> Result<Option<SessionDescription>, NegotiationError> {
        if self.is_closed() || self.offer_sent {
            return Ok(None);
        }
        if self.role != Role::Initiator {
            tracing::warn!(
                target: "lagoon::peer",
                peer_id = %self.peer_id,
                "responder session asked to offer; ignoring"
            );
            return Ok(None);
        }
        self.enter_negotiating();

        media
            .attach_to(self)
            .await
            .map_err(NegotiationError::LocalDescription)?;
        let offer = self
            .transport
            .create_offer()
            .await
            .map_err(NegotiationError::LocalDescription)?;
        self.transport
            .set_local_description(offer.clone())
            .await
            .map_err(NegotiationError::LocalDescription)?;
        if self.is_closed() {
            return Ok(None);
        }
        self.offer_sent = true;
        tracing::debug!(target: "lagoon::peer", peer_id = %self.peer_id, "local offer ready");
        Ok(Some(offer))
    }

    /// Responder path: install the remote offer, flush buffered candidates,
    /// attach tracks and produce the answer to send back.
    pub async fn accept_offer(
        &mut self,
        offer: SessionDescription,
        media: &LocalMediaController,
    ) -> Result<Option<SessionDescription>, NegotiationError> {
        if self.is_closed() {
            return Ok(None);
        }
        if self.offer_sent {
            tracing::warn!(
                target: "lagoon::peer",
                peer_id = %self.peer_id,
                "offer collision; keeping our own offer"
            );
            return Ok(None);
        }
        if self.remote_description_set {
            tracing::warn!(
                target: "lagoon::peer",
                peer_id = %self.peer_id,
                "duplicate remote offer ignored"
            );
            return Ok(None);
        }
        self.enter_negotiating();

        self.transport
            .set_remote_description(offer)
            .await
            .map_err(NegotiationError::RemoteDescription)?;
        self.remote_description_set = true;
        self.flush_pending_candidates().await;

        media
            .attach_to(self)
            .await
            .map_err(NegotiationError::LocalDescription)?;
        let answer = self
            .transport
            .create_answer()
            .await
            .map_err(NegotiationError::LocalDescription)?;
        self.transport
            .set_local_description(answer.clone())
            .await
            .map_err(NegotiationError::LocalDescription)?;
        if self.is_closed() {
            return Ok(None);
        }
        self.answer_sent = true;
        tracing::debug!(target: "lagoon::peer", peer_id = %self.peer_id, "local answer ready");
        Ok(Some(answer))
    }

    pub async fn accept_answer(
        &mut self,
        answer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if self.is_closed() {
            return Ok(());
        }
        if !self.offer_sent {
            tracing::warn!(
                target: "lagoon::peer",
                peer_id = %self.peer_id,
                "answer without an outstanding offer ignored"
            );
            return Ok(());
        }
        if self.remote_description_set {
            tracing::warn!(
                target: "lagoon::peer",
                peer_id = %self.peer_id,
                "duplicate remote answer ignored"
            );
            return Ok(());
        }
        self.transport
            .set_remote_description(answer)
            .await
            .map_err(NegotiationError::RemoteDescription)?;
        self.remote_description_set = true;
        self.flush_pending_candidates().await;
        Ok(())
    }

    /// Applies the candidate now if the remote description is in place,
    /// otherwise queues it in receipt order.
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.is_closed() {
            return;
        }
        if !self.remote_description_set {
            self.pending_candidates.push_back(candidate);
            tracing::trace!(
                target: "lagoon::peer",
                peer_id = %self.peer_id,
                pending = self.pending_candidates.len(),
                "buffered remote ice candidate"
            );
            return;
        }
        self.apply_candidate(candidate).await;
    }

    async fn flush_pending_candidates(&mut self) {
        if self.pending_candidates.is_empty() {
            return;
        }
        tracing::debug!(
            target: "lagoon::peer",
            peer_id = %self.peer_id,
            count = self.pending_candidates.len(),
            "flushing buffered ice candidates"
        );
        while let Some(candidate) = self.pending_candidates.pop_front() {
            if self.is_closed() {
                break;
            }
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&mut self, candidate: IceCandidate) {
        let text = candidate.candidate.clone();
        if let Err(error) = self.transport.add_ice_candidate(candidate).await {
            IceApplyWarning {
                peer_id: self.peer_id.clone(),
                candidate: text,
                error,
            }
            .log();
        }
    }

    /// Records an inbound track. The first one moves the session to
    /// `Connected`. Returns the updated stream for the UI.
    pub fn on_remote_track(&mut self, track: RemoteTrack) -> Option<RemoteStream> {
        if self.is_closed() {
            return None;
        }
        if self.remote_tracks.iter().any(|known| known.id() == track.id()) {
            return self.remote_stream();
        }
        tracing::info!(
            target: "lagoon::peer",
            peer_id = %self.peer_id,
            kind = %track.kind(),
            track_id = %track.id(),
            "remote track received"
        );
        self.remote_tracks.push(track);
        if self.state != SessionState::Connected {
            self.state = SessionState::Connected;
            self.negotiation_started = None;
        }
        self.remote_stream()
    }

    /// Terminal. Closes the transport and drops buffered candidates and
    /// track references.
    pub async fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.state = SessionState::Closed;
        self.pending_candidates.clear();
        self.remote_tracks.clear();
        self.negotiation_started = None;
        if let Err(err) = self.transport.close().await {
            tracing::debug!(
                target: "lagoon::peer",
                peer_id = %self.peer_id,
                error = %err,
                "transport close reported an error"
            );
        }
        tracing::debug!(
            target: "lagoon::peer",
            peer_id = %self.peer_id,
            generation = self.generation,
            "session closed"
        );
    }
}
