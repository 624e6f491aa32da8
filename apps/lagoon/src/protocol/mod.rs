//! Signaling vocabulary exchanged with the relay.
//!
//! Frames are JSON objects of the form `{"event": "<name>", "data": <payload>}`.
//! Outbound frames are [`ClientEvent`]s, inbound frames are [`RelayEvent`]s;
//! both enums are closed so anything the relay sends outside this table is
//! rejected at decode time instead of travelling further as untyped JSON.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

pub type PeerId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpKind::Offer => f.write_str("offer"),
            SdpKind::Answer => f.write_str("answer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Browser-compatible `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinRoom {
        room: String,
    },
    LeaveRoom {
        room: String,
    },
    Offer {
        to: PeerId,
        offer: SessionDescription,
        room: String,
    },
    Answer {
        to: PeerId,
        answer: SessionDescription,
        room: String,
    },
    IceCandidate {
        to: PeerId,
        candidate: IceCandidate,
        room: String,
    },
}

impl ClientEvent {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum RelayEvent {
    AllUsers(Vec<PeerId>),
    UserJoined(PeerId),
    UserLeft(PeerId),
    Offer {
        from: PeerId,
        offer: SessionDescription,
        room: String,
    },
    Answer {
        from: PeerId,
        answer: SessionDescription,
        room: String,
    },
    IceCandidate {
        from: PeerId,
        candidate: IceCandidate,
        room: String,
    },
}

/// Subscription key for [`RelayEvent`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AllUsers,
    UserJoined,
    UserLeft,
    Offer,
    Answer,
    IceCandidate,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::AllUsers,
        EventKind::UserJoined,
        EventKind::UserLeft,
        EventKind::Offer,
        EventKind::Answer,
        EventKind::IceCandidate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::AllUsers => "all-users",
            EventKind::UserJoined => "user-joined",
            EventKind::UserLeft => "user-left",
            EventKind::Offer => "offer",
            EventKind::Answer => "answer",
            EventKind::IceCandidate => "ice-candidate",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RelayEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RelayEvent::AllUsers(_) => EventKind::AllUsers,
            RelayEvent::UserJoined(_) => EventKind::UserJoined,
            RelayEvent::UserLeft(_) => EventKind::UserLeft,
            RelayEvent::Offer { .. } => EventKind::Offer,
            RelayEvent::Answer { .. } => EventKind::Answer,
            RelayEvent::IceCandidate { .. } => EventKind::IceCandidate,
        }
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
        if let Some(name) = value.get("event").and_then(serde_json::Value::as_str) {
            if EventKind::from_name(name).is_none() {
                return Err(ProtocolError::UnknownEvent(name.to_string()));
            }
        }
        serde_json::from_value(value).map_err(ProtocolError::Malformed)
    }

    /// The room a peer-addressed frame belongs to, if it carries one.
    pub fn room(&self) -> Option<&str> {
        match self {
            RelayEvent::Offer { room, .. }
            | RelayEvent::Answer { room, .. }
            | RelayEvent::IceCandidate { room, .. } => Some(room),
            _ => None,
        }
    }
}
