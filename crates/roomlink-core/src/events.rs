use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::capability::PeerState;
use crate::errors::RoomError;
use crate::identity::ParticipantId;
use crate::media::MediaKind;
use crate::protocol::Publication;

/// Events emitted by the core to presentation listeners.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    ConnectionStateChanged(ConnectionState),
    ParticipantJoined(ParticipantInfo),
    ParticipantUpdated(ParticipantInfo),
    ParticipantLeft(ParticipantId),
    ConnectivityChanged { participant: ParticipantId, state: ConnectivityState },
    PublicationsAdded { participant: ParticipantId, publications: Vec<Publication> },
    TrackBound(TrackInfo),
    SubscribeFailed { participant: ParticipantId, error: RoomError },
    MuteChanged { participant: ParticipantId, kind: MediaKind, muted: bool },
    MediaStateChanged { target: MediaTarget, state: PeerState },
    LocalPublished,
    /// The notification stream ended; room state is left as it was.
    SignalingLost,
    ChatMessageReceived(ChatMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Joining,
    Joined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Connected,
    Disconnected,
}

/// Which capability set a media state change belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaTarget {
    Publish,
    Subscription(ParticipantId),
}

/// Read-only snapshot of one table entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantInfo {
    pub id: ParticipantId,
    pub name: String,
    pub state: ConnectivityState,
    pub publications: Vec<Publication>,
    pub audio_muted: bool,
    pub video_muted: bool,
    pub track_count: usize,
    pub subscribed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub participant: ParticipantId,
    pub publication_id: String,
    pub kind: MediaKind,
    pub track_id: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOrigin {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: ParticipantId,
    pub sender_name: String,
    pub text: String,
    pub origin: MessageOrigin,
    pub timestamp_ms: i64,
}

/// Trait for receiving events from the core.
/// Implementations must be Send + Sync (called from tokio tasks).
pub trait RoomEventListener: Send + Sync {
    fn on_event(&self, event: RoomEvent);
}

type ListenerList = Vec<(u64, Arc<dyn RoomEventListener>)>;

/// Internal event emitter that dispatches to registered listeners.
///
/// Each event is delivered exactly once to every listener registered at the
/// time of the call, in registration order.
#[derive(Clone)]
pub struct EventEmitter {
    listeners: Arc<RwLock<ListenerList>>,
    next_id: Arc<AtomicU64>,
}

/// Registration returned by [`EventEmitter::add_listener`].
pub struct ListenerHandle {
    id: u64,
    listeners: Arc<RwLock<ListenerList>>,
}

impl ListenerHandle {
    pub fn unsubscribe(self) {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.retain(|(id, _)| *id != self.id);
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn RoomEventListener>) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, listener));
        ListenerHandle {
            id,
            listeners: self.listeners.clone(),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn emit(&self, event: RoomEvent) {
        // Snapshot first: a listener may unsubscribe from inside on_event.
        let listeners: Vec<Arc<dyn RoomEventListener>> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener.on_event(event.clone());
        }
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}
