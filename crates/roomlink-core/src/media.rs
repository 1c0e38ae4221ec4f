use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::identity::ParticipantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// A media track produced by a capability set.
///
/// Enablement is a local rendering concern; toggling it never renegotiates.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
}

pub type TrackHandle = Arc<dyn MediaTrack>;

/// Capture constraints passed to `CapabilitySet::open_devices`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MediaConstraints {
    #[serde(default = "default_true")]
    pub audio: bool,
    #[serde(default = "default_true")]
    pub video: bool,
    #[serde(default)]
    pub video_width: Option<u32>,
    #[serde(default)]
    pub video_height: Option<u32>,
    #[serde(default)]
    pub frame_rate: Option<u32>,
}

fn default_true() -> bool {
    true
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            video_width: None,
            video_height: None,
            frame_rate: None,
        }
    }
}

/// Locally captured device stream owned by the publish session.
#[derive(Debug)]
pub struct CaptureStream {
    pub id: String,
    pub tracks: Vec<TrackHandle>,
}

pub type LocalStream = Arc<CaptureStream>;

#[derive(Debug, Default)]
struct InboundInner {
    tracks: Vec<TrackHandle>,
    audio_muted: bool,
    video_muted: bool,
}

/// Combined inbound media of one remote participant.
///
/// Created once per participant and only ever appended to. Clones share the
/// same storage, so a renderer holding a clone sees tracks appended later.
/// The mute flags live under the same lock as the track list: a track is
/// appended with the flag value current at that instant.
#[derive(Debug, Clone, Default)]
pub struct InboundMedia {
    inner: Arc<Mutex<InboundInner>>,
}

impl InboundMedia {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, InboundInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn tracks(&self) -> Vec<TrackHandle> {
        self.lock().tracks.clone()
    }

    pub fn tracks_of(&self, kind: MediaKind) -> Vec<TrackHandle> {
        self.lock()
            .tracks
            .iter()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().tracks.is_empty()
    }

    pub fn is_muted(&self, kind: MediaKind) -> bool {
        let inner = self.lock();
        match kind {
            MediaKind::Audio => inner.audio_muted,
            MediaKind::Video => inner.video_muted,
        }
    }

    /// Whether both handles point at the same buffer.
    pub fn same_buffer(&self, other: &InboundMedia) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Record the flag and apply it to every current track of `kind`.
    ///
    /// Returns the number of tracks touched.
    pub(crate) fn set_muted(&self, kind: MediaKind, muted: bool) -> usize {
        let mut inner = self.lock();
        match kind {
            MediaKind::Audio => inner.audio_muted = muted,
            MediaKind::Video => inner.video_muted = muted,
        }
        let mut touched = 0;
        for track in inner.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(!muted);
            touched += 1;
        }
        touched
    }

    /// Enable/disable `track` from the current mute flag and append it.
    ///
    /// A track whose id is already present is not appended twice.
    pub(crate) fn append(&self, track: TrackHandle) -> bool {
        let mut inner = self.lock();
        if inner.tracks.iter().any(|t| t.id() == track.id()) {
            return false;
        }
        let muted = match track.kind() {
            MediaKind::Audio => inner.audio_muted,
            MediaKind::Video => inner.video_muted,
        };
        track.set_enabled(!muted);
        inner.tracks.push(track);
        true
    }
}

/// Presentation-side sink bound to one participant's inbound media.
///
/// The sink never owns lifecycle: it is handed a clone of the buffer on
/// attach and told to let go of it on detach.
pub trait RenderSink: Send + Sync {
    fn attach(&self, participant: &ParticipantId, media: InboundMedia);
    fn detach(&self, participant: &ParticipantId);
}
