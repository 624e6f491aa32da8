use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::media::MediaConstraints;
use crate::protocol::PeerId;
use crate::signaling::ReconnectPolicy;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:5000/ws";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Which side of a pair sends the first offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitiatorPolicy {
    /// The joiner dials everyone listed in `all-users`; existing members wait.
    #[default]
    Newcomer,
    /// Existing members dial whoever shows up in `user-joined`.
    Incumbent,
}

impl FromStr for InitiatorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "newcomer" => Ok(InitiatorPolicy::Newcomer),
            "incumbent" => Ok(InitiatorPolicy::Incumbent),
            other => Err(format!("unknown initiator policy '{other}'")),
        }
    }
}

/// A STUN or TURN server. Parsed from `url` or `url|username|credential`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub(crate) fn to_rtc(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

impl FromStr for IceServer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, '|');
        let url = parts.next().unwrap_or_default().trim();
        if !(url.starts_with("stun:") || url.starts_with("turn:") || url.starts_with("turns:")) {
            return Err(format!("'{url}' is not a stun/turn url"));
        }
        let username = parts.next().map(str::to_string);
        let credential = parts.next().map(str::to_string);
        if url.starts_with("turn") && (username.is_none() || credential.is_none()) {
            return Err(format!("turn server '{url}' needs username and credential"));
        }
        Ok(Self {
            urls: vec![url.to_string()],
            username,
            credential,
        })
    }
}

pub fn parse_ice_servers(raw: &str) -> Result<Vec<IceServer>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(IceServer::from_str)
        .collect()
}

/// Default ICE list: one public STUN server, or nothing when
/// `LAGOON_LOCALHOST_ONLY` is set.
pub fn default_ice_servers() -> Vec<IceServer> {
    if env::var("LAGOON_LOCALHOST_ONLY").is_ok() {
        Vec::new()
    } else {
        vec![IceServer::stun(DEFAULT_STUN_SERVER)]
    }
}

#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub room: String,
    pub signaling_url: String,
    /// Our own id as the relay knows it, when the relay tells us. Membership
    /// events naming it are ignored.
    pub local_id: Option<PeerId>,
    pub ice_servers: Vec<IceServer>,
    pub reconnect: ReconnectPolicy,
    pub initiator_policy: InitiatorPolicy,
    /// `None` leaves a stuck negotiation in place until teardown.
    pub negotiation_timeout: Option<Duration>,
    pub constraints: MediaConstraints,
}

impl RoomConfig {
    pub fn new(signaling_url: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            signaling_url: signaling_url.into(),
            local_id: None,
            ice_servers: default_ice_servers(),
            reconnect: ReconnectPolicy::default(),
            initiator_policy: InitiatorPolicy::default(),
            negotiation_timeout: None,
            constraints: MediaConstraints::default(),
        }
    }

    pub fn with_initiator_policy(mut self, policy: InitiatorPolicy) -> Self {
        self.initiator_policy = policy;
        self
    }

    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = Some(timeout);
        self
    }

    pub fn with_local_id(mut self, id: impl Into<PeerId>) -> Self {
        self.local_id = Some(id.into());
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Loads everything from `LAGOON_*` variables. `LAGOON_ROOM` is required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let room = env::var("LAGOON_ROOM").map_err(|_| ConfigError::Missing("LAGOON_ROOM"))?;
        let url = env::var("LAGOON_SIGNALING_URL")
            .unwrap_or_else(|_| DEFAULT_SIGNALING_URL.to_string());
        let mut config = Self::new(url, room);

        if let Ok(raw) = env::var("LAGOON_ICE_SERVERS") {
            config.ice_servers = parse_ice_servers(&raw).map_err(|reason| ConfigError::Invalid {
                var: "LAGOON_ICE_SERVERS",
                reason,
            })?;
        }
        if let Ok(raw) = env::var("LAGOON_NEGOTIATION_TIMEOUT_MS") {
            let ms: u64 = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                var: "LAGOON_NEGOTIATION_TIMEOUT_MS",
                reason: format!("'{raw}' is not a number of milliseconds"),
            })?;
            config.negotiation_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Ok(id) = env::var("LAGOON_LOCAL_ID") {
            let id = id.trim();
            if !id.is_empty() {
                config.local_id = Some(id.to_string());
            }
        }
        if let Ok(raw) = env::var("LAGOON_INITIATOR_POLICY") {
            config.initiator_policy = raw.parse().map_err(|reason| ConfigError::Invalid {
                var: "LAGOON_INITIATOR_POLICY",
                reason,
            })?;
        }
        Ok(config)
    }
}
