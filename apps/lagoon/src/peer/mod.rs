//! Per-participant negotiation: the transport seam, the session state
//! machine and the registry that owns every session.

pub mod mock;
mod registry;
mod rtc;
mod session;
mod transport;

pub use registry::{Peer, PeerRegistry, PeerView};
pub use rtc::{RtcTransport, RtcTransportFactory};
pub use session::{PeerSession, Role, SessionState};
pub use transport::{
    LinkState, PeerTransport, SessionSignal, TransportEvent, TransportEvents, TransportFactory,
};
