use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{LocalStream, LocalTrack, MediaKind};
use crate::error::MediaAcquisitionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl MediaConstraints {
    pub fn kinds(&self) -> Vec<MediaKind> {
        let mut kinds = Vec::with_capacity(2);
        if self.audio {
            kinds.push(MediaKind::Audio);
        }
        if self.video {
            kinds.push(MediaKind::Video);
        }
        kinds
    }
}

/// Capture backend. Implementations decide what "camera" and "microphone"
/// mean on the host.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, MediaAcquisitionError>;
}

/// Opus + VP8 sample tracks that the application feeds with encoded frames
/// through [`LocalTrack::write_sample`].
#[derive(Debug, Clone)]
pub struct SampleDevices {
    available: HashSet<MediaKind>,
    permission_granted: bool,
}

impl Default for SampleDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleDevices {
    pub fn new() -> Self {
        Self {
            available: [MediaKind::Audio, MediaKind::Video].into_iter().collect(),
            permission_granted: true,
        }
    }

    pub fn without(mut self, kind: MediaKind) -> Self {
        self.available.remove(&kind);
        self
    }

    pub fn deny_permission(mut self) -> Self {
        self.permission_granted = false;
        self
    }

    fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
        match kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl MediaDevices for SampleDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, MediaAcquisitionError> {
        if !self.permission_granted {
            return Err(MediaAcquisitionError::PermissionDenied);
        }
        let kinds = constraints.kinds();
        if kinds.is_empty() {
            return Err(MediaAcquisitionError::Device(
                "constraints request neither audio nor video".into(),
            ));
        }
        let stream_id = Uuid::new_v4().to_string();
        let mut tracks = Vec::with_capacity(kinds.len());
        for kind in kinds {
            if !self.available.contains(&kind) {
                return Err(MediaAcquisitionError::DeviceNotFound(kind));
            }
            let track = TrackLocalStaticSample::new(
                Self::codec_for(kind),
                format!("{}-{}", kind, Uuid::new_v4()),
                stream_id.clone(),
            );
            tracks.push(LocalTrack::new(kind, Arc::new(track)));
        }
        Ok(LocalStream::new(stream_id, tracks))
    }
}
