//! Local capture and remote stream handles.

mod devices;
mod remote;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::{MediaAcquisitionError, TransportError};
use crate::peer::PeerSession;

pub use devices::{MediaConstraints, MediaDevices, SampleDevices};
pub use remote::{RemoteStream, RemoteTrack};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    pub(crate) fn from_codec_type(kind: RTPCodecType) -> Option<Self> {
        match kind {
            RTPCodecType::Audio => Some(MediaKind::Audio),
            RTPCodecType::Video => Some(MediaKind::Video),
            _ => None,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One captured track. Clones share the same underlying RTP track, so a
/// single capture can be attached to every peer connection in the room.
#[derive(Clone)]
pub struct LocalTrack {
    kind: MediaKind,
    track: Arc<TrackLocalStaticSample>,
    ended: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            kind,
            track,
            ended: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    pub fn stream_id(&self) -> &str {
        self.track.stream_id()
    }

    pub fn rtp_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.track) as Arc<dyn TrackLocal + Send + Sync>
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Feeds one encoded frame to every connection the track is attached to.
    pub async fn write_sample(&self, sample: &Sample) -> Result<(), TransportError> {
        if self.is_ended() {
            return Err(TransportError::Closed);
        }
        self.track
            .write_sample(sample)
            .await
            .map_err(|err| TransportError::Media(err.to_string()))
    }

    fn stop(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("id", &self.id())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// Handle to the local capture, shown to the UI as the self-view.
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Arc<Vec<LocalTrack>>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks: Arc::new(tracks),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn track(&self, kind: MediaKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|track| track.kind() == kind)
    }

    pub fn is_ended(&self) -> bool {
        self.tracks.iter().all(LocalTrack::is_ended)
    }

    fn stop(&self) {
        for track in self.tracks.iter() {
            track.stop();
        }
    }
}

/// Owns the local capture for the lifetime of a call. Peer sessions only get
/// read access through [`attach_to`](Self::attach_to); stopping tracks is
/// reserved to [`release`](Self::release).
pub struct LocalMediaController {
    devices: Arc<dyn MediaDevices>,
    constraints: MediaConstraints,
    stream: Option<LocalStream>,
}

impl LocalMediaController {
    pub fn new(devices: Arc<dyn MediaDevices>, constraints: MediaConstraints) -> Self {
        Self {
            devices,
            constraints,
            stream: None,
        }
    }

    pub async fn acquire(&mut self) -> Result<LocalStream, MediaAcquisitionError> {
        if let Some(stream) = &self.stream {
            return Ok(stream.clone());
        }
        let stream = self.devices.get_user_media(&self.constraints).await?;
        tracing::info!(
            target: "lagoon::media",
            stream_id = %stream.id(),
            tracks = stream.tracks().len(),
            "local media acquired"
        );
        self.stream = Some(stream.clone());
        Ok(stream)
    }

    /// Stops every track and forgets the stream. Returns whether anything was
    /// held.
    pub fn release(&mut self) -> bool {
        match self.stream.take() {
            Some(stream) => {
                stream.stop();
                tracing::info!(
                    target: "lagoon::media",
                    stream_id = %stream.id(),
                    "local media released"
                );
                true
            }
            None => false,
        }
    }

    pub fn stream(&self) -> Option<&LocalStream> {
        self.stream.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    /// Adds every local track to the session's transport. Safe to call for any
    /// number of sessions; the capture itself is shared, never handed over.
    pub async fn attach_to(&self, session: &mut PeerSession) -> Result<usize, TransportError> {
        session.attach_local_tracks(self.stream.as_ref()).await
    }
}
