//! In-process transport for tests and offline runs.
//!
//! [`MockTransport`] records every call it receives and mimics the parts of a
//! real peer connection the coordinator depends on: descriptions must look
//! like SDP, candidates are refused before a remote description exists, and
//! once both descriptions are in place the "remote" tracks show up.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::transport::{LinkState, PeerTransport, TransportEvent, TransportEvents, TransportFactory};
use crate::error::TransportError;
use crate::media::{LocalTrack, MediaKind, RemoteTrack};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    AddTrack(MediaKind),
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    AddCandidate(String),
    Close,
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<MockCall>,
    local: Option<SdpKind>,
    remote: Option<SdpKind>,
    tracks_announced: bool,
    closed: bool,
}

#[derive(Clone)]
pub struct MockTransport {
    events: TransportEvents,
    simulate: bool,
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Emits candidates and remote tracks as negotiation progresses.
    pub fn new(events: TransportEvents) -> Self {
        Self {
            events,
            simulate: true,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Records calls only; never emits transport events.
    pub fn quiet(events: TransportEvents) -> Self {
        Self {
            simulate: false,
            ..Self::new(events)
        }
    }

    pub fn peer_id(&self) -> &str {
        self.events.peer_id()
    }

    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|call| pred(call)).count()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Pushes an arbitrary event as if the media stack had raised it.
    pub fn inject(&self, event: TransportEvent) -> bool {
        self.events.emit(event)
    }

    fn record(&self, call: MockCall) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.calls.push(call);
        Ok(())
    }

    fn remote_tracks(&self) -> Vec<RemoteTrack> {
        let peer = self.events.peer_id();
        let stream = format!("{peer}-stream");
        vec![
            RemoteTrack::new(format!("{peer}-audio"), stream.clone(), MediaKind::Audio),
            RemoteTrack::new(format!("{peer}-video"), stream, MediaKind::Video),
        ]
    }

    fn maybe_connect(&self) {
        if !self.simulate {
            return;
        }
        {
            let mut state = self.state.lock();
            if state.local.is_none() || state.remote.is_none() || state.tracks_announced {
                return;
            }
            state.tracks_announced = true;
        }
        self.events.emit(TransportEvent::Link(LinkState::Connected));
        for track in self.remote_tracks() {
            self.events.emit(TransportEvent::Track(track));
        }
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        if track.is_ended() {
            return Err(TransportError::Media("track has ended".into()));
        }
        self.record(MockCall::AddTrack(track.kind()))
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.record(MockCall::CreateOffer)?;
        Ok(SessionDescription::offer(format!(
            "v=0\r\no=mock-offer {}\r\n",
            self.events.peer_id()
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        if self.state.lock().remote != Some(SdpKind::Offer) {
            return Err(TransportError::InvalidDescription(
                "cannot answer without a remote offer".into(),
            ));
        }
        self.record(MockCall::CreateAnswer)?;
        Ok(SessionDescription::answer(format!(
            "v=0\r\no=mock-answer {}\r\n",
            self.events.peer_id()
        )))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.record(MockCall::SetLocal(desc.kind))?;
        self.state.lock().local = Some(desc.kind);
        if self.simulate {
            self.events.emit(TransportEvent::LocalCandidate(IceCandidate {
                candidate: format!(
                    "candidate:1 1 udp 2130706431 127.0.0.1 50000 typ host {}",
                    desc.kind
                ),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            }));
        }
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        if !desc.sdp.starts_with("v=0") {
            return Err(TransportError::InvalidDescription(
                "sdp must start with v=0".into(),
            ));
        }
        self.record(MockCall::SetRemote(desc.kind))?;
        self.state.lock().remote = Some(desc.kind);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        if self.state.lock().remote.is_none() {
            return Err(TransportError::Candidate(
                "remote description not set".into(),
            ));
        }
        if !candidate.candidate.starts_with("candidate:") {
            return Err(TransportError::Candidate(candidate.candidate));
        }
        self.record(MockCall::AddCandidate(candidate.candidate))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.calls.push(MockCall::Close);
        state.closed = true;
        Ok(())
    }
}

/// Hands out [`MockTransport`]s and keeps a handle to each for inspection.
#[derive(Clone, Default)]
pub struct MockTransportFactory {
    created: Arc<Mutex<Vec<MockTransport>>>,
    quiet: bool,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn quiet() -> Self {
        Self {
            quiet: true,
            ..Self::default()
        }
    }

    pub fn created(&self) -> Vec<MockTransport> {
        self.created.lock().clone()
    }

    /// Most recent transport built for `peer_id`.
    pub fn latest(&self, peer_id: &str) -> Option<MockTransport> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|transport| transport.peer_id() == peer_id)
            .cloned()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(
        &self,
        _peer_id: &str,
        events: TransportEvents,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        let transport = if self.quiet {
            MockTransport::quiet(events)
        } else {
            MockTransport::new(events)
        };
        self.created.lock().push(transport.clone());
        Ok(Box::new(transport))
    }
}
