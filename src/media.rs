//! Local capture lifecycle: acquire, mute/unmute, release.
//!
//! A [`LocalStream`] is owned by exactly one call. Its tracks are webrtc-rs
//! sample tracks so they can be attached to the peer connection as-is.
//! Releasing the stream (explicitly or by dropping it) stops every track.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{Error, Result};
use crate::utils::random_id;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

impl FromStr for TrackKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            other => Err(Error::invalid_state(format!("unknown track kind `{other}`"))),
        }
    }
}

/// What to capture. Defaults match a consultation: 720p video, audio with
/// echo cancellation and noise suppression.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    pub width: u32,
    pub height: u32,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            width: 1280,
            height: 720,
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            video: false,
            ..Self::default()
        }
    }
}

/// One captured track. Disabling it mutes (frames are dropped) without
/// touching the negotiated connection.
pub struct LocalTrack {
    kind: TrackKind,
    rtp: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    live: AtomicBool,
    live_counter: Arc<AtomicUsize>,
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("id", &self.rtp.id())
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

impl LocalTrack {
    fn new(kind: TrackKind, stream_id: &str, live_counter: Arc<AtomicUsize>) -> Self {
        let mime_type = match kind {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let rtp = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            format!("{kind}-{}", random_id()),
            stream_id.to_owned(),
        ));
        live_counter.fetch_add(1, Ordering::SeqCst);

        Self {
            kind,
            rtp,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
            live_counter,
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtp)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Push one encoded frame. Returns false when the frame was dropped
    /// because the track is muted or stopped.
    pub async fn write_frame(&self, data: Bytes, duration: Duration) -> Result<bool> {
        if !self.is_live() || !self.is_enabled() {
            return Ok(false);
        }
        self.rtp
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(true)
    }

    fn stop(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            self.live_counter.fetch_sub(1, Ordering::SeqCst);
            debug!(kind = %self.kind, id = %self.rtp.id(), "track stopped");
        }
    }
}

/// Captured audio/video owned by a single call
#[derive(Debug)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    pub fn is_enabled(&self, kind: TrackKind) -> bool {
        self.track(kind).is_some_and(|t| t.is_enabled())
    }

    /// Flip the `enabled` flag of the track of `kind`; returns the new value
    pub fn toggle_track(&self, kind: TrackKind) -> Result<bool> {
        let track = self
            .track(kind)
            .filter(|t| t.is_live())
            .ok_or_else(|| Error::invalid_state(format!("no live {kind} track")))?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        debug!(%kind, enabled, "track toggled");
        Ok(enabled)
    }

    pub fn active_track_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }

    /// Stop every track. Safe to call more than once.
    pub fn release(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

impl Drop for LocalStream {
    fn drop(&mut self) {
        self.release();
    }
}

/// Capture backend
pub trait MediaDevices: Send + Sync + 'static {
    fn acquire(
        &self,
        constraints: &MediaConstraints,
    ) -> impl Future<Output = Result<LocalStream>> + Send;
}

/// Capture backend that produces encoder-fed sample tracks. Permission and
/// device presence can be switched off to reproduce capture failures.
#[derive(Debug, Clone)]
pub struct SyntheticDevices {
    permission_granted: Arc<AtomicBool>,
    has_camera: Arc<AtomicBool>,
    has_microphone: Arc<AtomicBool>,
    live_tracks: Arc<AtomicUsize>,
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self {
            permission_granted: Arc::new(AtomicBool::new(true)),
            has_camera: Arc::new(AtomicBool::new(true)),
            has_microphone: Arc::new(AtomicBool::new(true)),
            live_tracks: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn deny_permission(&self) {
        self.permission_granted.store(false, Ordering::SeqCst);
    }

    pub fn unplug_camera(&self) {
        self.has_camera.store(false, Ordering::SeqCst);
    }

    pub fn unplug_microphone(&self) {
        self.has_microphone.store(false, Ordering::SeqCst);
    }

    /// Tracks acquired from this backend that have not been stopped
    pub fn live_tracks(&self) -> usize {
        self.live_tracks.load(Ordering::SeqCst)
    }
}

impl MediaDevices for SyntheticDevices {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream> {
        if !constraints.audio && !constraints.video {
            return Err(Error::device_unavailable("no audio or video requested"));
        }
        if !self.permission_granted.load(Ordering::SeqCst) {
            return Err(Error::media_denied("camera/microphone permission denied"));
        }
        if constraints.video && !self.has_camera.load(Ordering::SeqCst) {
            return Err(Error::device_unavailable("no camera found"));
        }
        if constraints.audio && !self.has_microphone.load(Ordering::SeqCst) {
            return Err(Error::device_unavailable("no microphone found"));
        }

        let id = format!("stream-{}", random_id());
        let mut tracks = Vec::with_capacity(2);
        if constraints.audio {
            tracks.push(LocalTrack::new(
                TrackKind::Audio,
                &id,
                Arc::clone(&self.live_tracks),
            ));
        }
        if constraints.video {
            tracks.push(LocalTrack::new(
                TrackKind::Video,
                &id,
                Arc::clone(&self.live_tracks),
            ));
        }

        info!(
            stream = %id,
            audio = constraints.audio,
            video = constraints.video,
            width = constraints.width,
            height = constraints.height,
            "local media acquired"
        );
        Ok(LocalStream { id, tracks })
    }
}
