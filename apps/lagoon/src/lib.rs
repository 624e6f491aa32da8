pub mod config;
pub mod error;
pub mod media;
pub mod peer;
pub mod protocol;
pub mod room;
pub mod signaling;
pub mod telemetry;

pub use config::{IceServer, InitiatorPolicy, RoomConfig};
pub use error::{CallError, MediaAcquisitionError, NegotiationError, SignalingError};
pub use room::{RoomCoordinator, RoomHandle, RoomSnapshot};
