use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::capability::{
    CapabilityEvent, CapabilityInstance, Direction, IceMode, NegotiationState, Negotiator,
};
use crate::errors::RoomError;
use crate::events::{EventEmitter, MediaTarget, RoomEvent};
use crate::media::{LocalStream, MediaConstraints, MediaKind};
use crate::room::JoinedRoom;
use crate::signaling::SignalingClient;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// The local client's single outbound session.
///
/// Capture is opened once and reused; a failed negotiation leaves the
/// capture in place so the next call only retries the offer/answer.
pub struct PublishSession {
    negotiator: Negotiator,
    emitter: EventEmitter,
    capture: Mutex<Option<LocalStream>>,
    /// Held for the whole publish so concurrent calls share one negotiation.
    published: tokio::sync::Mutex<bool>,
    cancel: CancellationToken,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl PublishSession {
    pub fn start(instance: CapabilityInstance, ice_mode: IceMode, emitter: EventEmitter) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let watcher = tokio::spawn(watch_events(instance.events, emitter.clone(), cancel.clone()));
        Arc::new(Self {
            negotiator: Negotiator::new(instance.set, Direction::Send, ice_mode),
            emitter,
            capture: Mutex::new(None),
            published: tokio::sync::Mutex::new(false),
            cancel,
            watcher: Mutex::new(Some(watcher)),
        })
    }

    pub fn capture(&self) -> Option<LocalStream> {
        lock(&self.capture).clone()
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.negotiator.state()
    }

    async fn cancellable<T>(
        &self,
        fut: impl Future<Output = Result<T, RoomError>>,
    ) -> Result<T, RoomError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(RoomError::Cancelled),
            res = fut => res,
        }
    }

    /// Open capture if needed and negotiate it with the server through `push`.
    pub async fn publish(
        &self,
        constraints: &MediaConstraints,
        signaling: &SignalingClient,
        room: &JoinedRoom,
    ) -> Result<LocalStream, RoomError> {
        let mut published = tokio::select! {
            _ = self.cancel.cancelled() => return Err(RoomError::Cancelled),
            guard = self.published.lock() => guard,
        };

        let capture = match self.capture() {
            Some(capture) => capture,
            None => {
                let stream = self
                    .cancellable(self.negotiator.open_devices(constraints))
                    .await?;
                let stream: LocalStream = Arc::new(stream);
                info!("capture {} opened with {} tracks", stream.id, stream.tracks.len());
                *lock(&self.capture) = Some(stream.clone());
                stream
            }
        };
        if *published {
            return Ok(capture);
        }

        let offer = self.cancellable(self.negotiator.create_offer()).await?;
        let pushed = self
            .cancellable(signaling.push(&room.room_id, &room.user_id, offer))
            .await;
        let answer = match pushed {
            Ok(answer) => answer,
            Err(e) => {
                self.negotiator.rollback();
                return Err(e);
            }
        };
        self.cancellable(self.negotiator.apply_answer(&answer)).await?;

        *published = true;
        info!("local media published");
        self.emitter.emit(RoomEvent::LocalPublished);
        Ok(capture)
    }

    pub async fn is_published(&self) -> bool {
        *self.published.lock().await
    }

    /// Enable or disable the captured tracks of `kind`; returns how many changed.
    pub fn set_track_enabled(&self, kind: MediaKind, enabled: bool) -> usize {
        let Some(capture) = self.capture() else {
            return 0;
        };
        let mut changed = 0;
        for track in capture.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
            changed += 1;
        }
        debug!("local {kind} tracks enabled={enabled} ({changed})");
        changed
    }

    pub async fn close(&self) {
        self.cancel.cancel();
        let watcher = lock(&self.watcher).take();
        if let Some(watcher) = watcher {
            let _ = watcher.await;
        }
        self.negotiator.close().await;
        debug!("publish session closed");
    }
}

async fn watch_events(
    mut events: mpsc::UnboundedReceiver<CapabilityEvent>,
    emitter: EventEmitter,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            CapabilityEvent::ConnectionStateChange(state) => {
                debug!("publish media state {state:?}");
                emitter.emit(RoomEvent::MediaStateChanged {
                    target: MediaTarget::Publish,
                    state,
                });
            }
            CapabilityEvent::IceCandidate(candidate) => trace!("local candidate: {candidate}"),
            CapabilityEvent::Track { slot, .. } => {
                warn!("unexpected inbound track on publish session (slot {slot})");
            }
        }
    }
}
