use std::collections::HashMap;

use crate::media::RemoteStream;
use crate::protocol::PeerId;

use super::session::{PeerSession, SessionState};

/// One remote participant: its session plus the join-order slot used to keep
/// the UI list stable.
pub struct Peer {
    seq: u64,
    session: PeerSession,
}

impl Peer {
    pub fn peer_id(&self) -> &str {
        self.session.peer_id()
    }

    pub fn session(&self) -> &PeerSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut PeerSession {
        &mut self.session
    }

    pub fn view(&self) -> PeerView {
        PeerView {
            peer_id: self.session.peer_id().to_string(),
            state: self.session.state(),
            stream: self.session.remote_stream(),
        }
    }
}

/// What the UI renders for one participant.
#[derive(Debug, Clone)]
pub struct PeerView {
    pub peer_id: PeerId,
    pub state: SessionState,
    pub stream: Option<RemoteStream>,
}

/// The canonical "who is in the call" set. Sessions live only inside it, so
/// registry membership and open sessions cannot drift apart.
#[derive(Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, Peer>,
    next_seq: u64,
    next_generation: u64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generation numbers are never reused, even across calls.
    pub fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Adds the session unless its peer id is already present, in which case
    /// the session is handed back untouched.
    pub fn try_insert(&mut self, session: PeerSession) -> Result<(), PeerSession> {
        if self.peers.contains_key(session.peer_id()) {
            return Err(session);
        }
        self.next_seq += 1;
        let peer = Peer {
            seq: self.next_seq,
            session,
        };
        self.peers.insert(peer.peer_id().to_string(), peer);
        Ok(())
    }

    pub fn get(&self, peer_id: &str) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut Peer> {
        self.peers.get_mut(peer_id)
    }

    /// Returns the session only if it still belongs to `generation`.
    pub fn session_mut(&mut self, peer_id: &str, generation: u64) -> Option<&mut PeerSession> {
        self.peers
            .get_mut(peer_id)
            .map(Peer::session_mut)
            .filter(|session| session.generation() == generation)
    }

    /// Closes the session, then forgets the peer.
    pub async fn remove(&mut self, peer_id: &str) -> bool {
        match self.peers.remove(peer_id) {
            Some(mut peer) => {
                peer.session.close().await;
                true
            }
            None => false,
        }
    }

    /// Closes and drops every session. Returns how many were open.
    pub async fn clear(&mut self) -> usize {
        let count = self.peers.len();
        for (_, mut peer) in self.peers.drain() {
            peer.session.close().await;
        }
        count
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.ordered().map(|peer| peer.peer_id().to_string()).collect()
    }

    /// Peers in join order.
    pub fn peers(&self) -> Vec<PeerView> {
        self.ordered().map(Peer::view).collect()
    }

    /// Sessions that have been negotiating for at least `limit`.
    pub fn stalled(&self, limit: std::time::Duration) -> Vec<(PeerId, u64)> {
        self.peers
            .values()
            .filter(|peer| peer.session.state() == SessionState::Negotiating)
            .filter(|peer| {
                peer.session
                    .negotiation_started()
                    .is_some_and(|started| started.elapsed() >= limit)
            })
            .map(|peer| (peer.peer_id().to_string(), peer.session.generation()))
            .collect()
    }

    fn ordered(&self) -> impl Iterator<Item = &Peer> {
        let mut peers: Vec<&Peer> = self.peers.values().collect();
        peers.sort_by_key(|peer| peer.seq);
        peers.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::mock::MockTransport;
    use crate::peer::{Role, TransportEvents};
    use tokio::sync::mpsc;

    fn session(registry: &mut PeerRegistry, peer_id: &str) -> (PeerSession, MockTransport) {
        let (tx, _rx) = mpsc::unbounded_channel();
        let generation = registry.next_generation();
        let transport = MockTransport::quiet(TransportEvents::new(peer_id, generation, tx));
        let handle = transport.clone();
        (
            PeerSession::new(peer_id, generation, Role::Responder, Box::new(transport)),
            handle,
        )
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let mut registry = PeerRegistry::new();
        let (first, _) = session(&mut registry, "a");
        let (second, second_transport) = session(&mut registry, "a");
        assert!(registry.try_insert(first).is_ok());
        let rejected = registry.try_insert(second).unwrap_err();
        assert_eq!(rejected.peer_id(), "a");
        assert_eq!(registry.len(), 1);
        assert!(!second_transport.is_closed());
    }

    #[tokio::test]
    async fn peers_are_listed_in_join_order() {
        let mut registry = PeerRegistry::new();
        for id in ["zed", "amy", "mo"] {
            let (s, _) = session(&mut registry, id);
            registry.try_insert(s).unwrap();
        }
        assert_eq!(registry.ids(), vec!["zed", "amy", "mo"]);
        assert!(registry.remove("amy").await);
        assert_eq!(registry.ids(), vec!["zed", "mo"]);
    }

    #[tokio::test]
    async fn remove_closes_before_dropping() {
        let mut registry = PeerRegistry::new();
        let (s, transport) = session(&mut registry, "a");
        registry.try_insert(s).unwrap();
        assert!(registry.remove("a").await);
        assert!(transport.is_closed());
        assert!(!registry.remove("a").await);
    }

    #[tokio::test]
    async fn stale_generations_are_not_returned() {
        let mut registry = PeerRegistry::new();
        let (s, transport) = session(&mut registry, "a");
        let old = transport.generation();
        registry.try_insert(s).unwrap();
        registry.remove("a").await;
        let (s, _) = session(&mut registry, "a");
        registry.try_insert(s).unwrap();
        assert!(registry.session_mut("a", old).is_none());
        assert!(registry.session_mut("a", old + 1).is_some());
    }

    #[tokio::test]
    async fn clear_closes_everything() {
        let mut registry = PeerRegistry::new();
        let mut transports = Vec::new();
        for id in ["a", "b"] {
            let (s, t) = session(&mut registry, id);
            registry.try_insert(s).unwrap();
            transports.push(t);
        }
        assert_eq!(registry.clear().await, 2);
        assert!(registry.is_empty());
        assert!(transports.iter().all(MockTransport::is_closed));
        assert_eq!(registry.clear().await, 0);
    }
}
