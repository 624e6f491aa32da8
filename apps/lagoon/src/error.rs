use std::time::Duration;

use thiserror::Error;

use crate::media::MediaKind;

/// Local capture could not be started. Fatal to `start_call`, recoverable by
/// calling it again.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaAcquisitionError {
    #[error("permission to use camera/microphone was denied")]
    PermissionDenied,
    #[error("no {0} capture device available")]
    DeviceNotFound(MediaKind),
    #[error("capture device failed: {0}")]
    Device(String),
}

/// Offer/answer exchange with one peer failed. Only that peer is dropped.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("remote description rejected: {0}")]
    RemoteDescription(#[source] TransportError),
    #[error("local description failed: {0}")]
    LocalDescription(#[source] TransportError),
    #[error("negotiation did not complete within {0:?}")]
    TimedOut(Duration),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("ice candidate rejected: {0}")]
    Candidate(String),
    #[error("media write failed: {0}")]
    Media(String),
    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid signaling url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("signaling channel closed")]
    Closed,
    #[error("failed to encode signaling frame: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed signaling frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("unknown signaling event '{0}'")]
    UnknownEvent(String),
}

/// Call-level failures returned to the UI layer.
#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Media(#[from] MediaAcquisitionError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("room coordinator has shut down")]
    Shutdown,
}

/// A remote candidate that could not be applied. Logged and ignored.
#[derive(Debug)]
pub struct IceApplyWarning {
    pub peer_id: String,
    pub candidate: String,
    pub error: TransportError,
}

impl IceApplyWarning {
    pub fn log(&self) {
        tracing::warn!(
            target: "lagoon::peer",
            peer_id = %self.peer_id,
            candidate = %self.candidate,
            error = %self.error,
            "ignoring remote ice candidate"
        );
    }
}
