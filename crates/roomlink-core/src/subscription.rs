//! Receive-only negotiation context for one remote participant.
//!
//! A session owns one receive-configured capability set and a
//! [`CorrelationTable`] mapping each publication to the slot reserved for it
//! and, once it arrives, the track delivered on that slot. A background
//! router consumes the capability's events and binds tracks into the table
//! independently of any caller waiting on them, so late and duplicate tracks
//! are recorded instead of dropped.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::capability::{
    CapabilityEvent, CapabilityInstance, Direction, IceMode, NegotiationState, Negotiator, SlotId,
};
use crate::errors::RoomError;
use crate::events::{EventEmitter, MediaTarget, RoomEvent, TrackInfo};
use crate::identity::ParticipantId;
use crate::media::{InboundMedia, MediaKind, TrackHandle};
use crate::protocol::PullSpec;
use crate::room::JoinedRoom;
use crate::signaling::SignalingClient;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone)]
pub struct SlotBinding {
    pub publication_id: String,
    pub kind: MediaKind,
    pub slot: SlotId,
    /// Most recent track delivered on the slot.
    pub track: Option<TrackHandle>,
    pub deliveries: u32,
    /// An answer covering this slot has been applied.
    pub negotiated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    Bound(String),
    /// A further track arrived on an already bound slot.
    Rebound(String),
    KindMismatch {
        publication_id: String,
        expected: MediaKind,
        actual: MediaKind,
    },
    UnknownSlot,
}

/// `publication id → slot → track`, in reservation order.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    bindings: Vec<SlotBinding>,
    unmatched: Vec<(SlotId, TrackHandle)>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn binding(&self, publication_id: &str) -> Option<&SlotBinding> {
        self.bindings
            .iter()
            .find(|b| b.publication_id == publication_id)
    }

    pub fn reserve(&mut self, spec: &PullSpec, slot: SlotId) {
        if self.is_reserved(&spec.publication_id) {
            return;
        }
        self.bindings.push(SlotBinding {
            publication_id: spec.publication_id.clone(),
            kind: spec.kind,
            slot,
            track: None,
            deliveries: 0,
            negotiated: false,
        });
    }

    pub fn is_reserved(&self, publication_id: &str) -> bool {
        self.binding(publication_id).is_some()
    }

    pub fn is_bound(&self, publication_id: &str) -> bool {
        self.binding(publication_id)
            .is_some_and(|b| b.track.is_some())
    }

    /// A track may arrive on the slot without another `pull`.
    pub fn is_negotiated(&self, publication_id: &str) -> bool {
        self.binding(publication_id)
            .is_some_and(|b| b.negotiated || b.track.is_some())
    }

    fn mark_negotiated(&mut self) {
        for binding in &mut self.bindings {
            binding.negotiated = true;
        }
    }

    pub fn slot_for(&self, publication_id: &str) -> Option<SlotId> {
        self.binding(publication_id).map(|b| b.slot.clone())
    }

    pub fn track_for(&self, publication_id: &str) -> Option<TrackHandle> {
        self.binding(publication_id).and_then(|b| b.track.clone())
    }

    pub fn bindings(&self) -> &[SlotBinding] {
        &self.bindings
    }

    /// Every reserved slot as a pull spec, in reservation order.
    pub fn specs(&self) -> Vec<PullSpec> {
        self.bindings
            .iter()
            .map(|b| PullSpec::new(b.kind, b.publication_id.clone()))
            .collect()
    }

    pub fn unmatched(&self) -> &[(SlotId, TrackHandle)] {
        &self.unmatched
    }

    pub fn bind(&mut self, slot: &str, track: TrackHandle) -> BindOutcome {
        let Some(binding) = self.bindings.iter_mut().find(|b| b.slot == slot) else {
            self.unmatched.push((slot.to_string(), track));
            return BindOutcome::UnknownSlot;
        };
        if binding.kind != track.kind() {
            let outcome = BindOutcome::KindMismatch {
                publication_id: binding.publication_id.clone(),
                expected: binding.kind,
                actual: track.kind(),
            };
            self.unmatched.push((slot.to_string(), track));
            return outcome;
        }
        let rebound = binding.track.is_some();
        binding.track = Some(track);
        binding.deliveries += 1;
        if rebound {
            BindOutcome::Rebound(binding.publication_id.clone())
        } else {
            BindOutcome::Bound(binding.publication_id.clone())
        }
    }
}

struct TrackRouter {
    participant: ParticipantId,
    correlation: Arc<Mutex<CorrelationTable>>,
    media: InboundMedia,
    bound: Arc<watch::Sender<u64>>,
    emitter: EventEmitter,
}

impl TrackRouter {
    async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<CapabilityEvent>,
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
            self.handle(event);
        }
        debug!("track router for {} stopped", self.participant);
    }

    fn handle(&self, event: CapabilityEvent) {
        match event {
            CapabilityEvent::Track { slot, track } => self.on_track(&slot, track),
            CapabilityEvent::IceCandidate(candidate) => {
                trace!("local candidate for {}: {candidate}", self.participant);
            }
            CapabilityEvent::ConnectionStateChange(state) => {
                debug!("subscription {} media state {state:?}", self.participant);
                self.emitter.emit(RoomEvent::MediaStateChanged {
                    target: MediaTarget::Subscription(self.participant.clone()),
                    state,
                });
            }
        }
    }

    fn on_track(&self, slot: &str, track: TrackHandle) {
        // Append while holding the table so a waiter never sees a bound
        // slot whose track is not yet in the buffer.
        let mut table = lock(&self.correlation);
        let outcome = table.bind(slot, track.clone());
        let publication_id = match outcome {
            BindOutcome::Bound(id) => id,
            BindOutcome::Rebound(id) => {
                debug!("slot {slot} of {} delivered again", self.participant);
                id
            }
            BindOutcome::KindMismatch {
                publication_id,
                expected,
                actual,
            } => {
                warn!(
                    "ignoring {actual} track on slot {slot} (publication {publication_id} expects {expected})"
                );
                return;
            }
            BindOutcome::UnknownSlot => {
                warn!("track on unreserved slot {slot} for {}", self.participant);
                return;
            }
        };
        self.media.append(track.clone());
        drop(table);

        self.bound.send_modify(|generation| *generation += 1);
        self.emitter.emit(RoomEvent::TrackBound(TrackInfo {
            participant: self.participant.clone(),
            publication_id,
            kind: track.kind(),
            track_id: track.id().to_string(),
            enabled: track.is_enabled(),
        }));
    }
}

pub struct SubscriptionSession {
    participant: ParticipantId,
    negotiator: Negotiator,
    correlation: Arc<Mutex<CorrelationTable>>,
    /// Serializes overlapping subscribe calls for this participant.
    negotiation: tokio::sync::Mutex<()>,
    bound: Arc<watch::Sender<u64>>,
    cancel: CancellationToken,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionSession {
    /// Wrap a receive-configured capability set and start routing its tracks
    /// into `media`.
    pub fn start(
        participant: ParticipantId,
        instance: CapabilityInstance,
        ice_mode: IceMode,
        media: InboundMedia,
        emitter: EventEmitter,
    ) -> Arc<Self> {
        let (bound_tx, _) = watch::channel(0u64);
        let bound = Arc::new(bound_tx);
        let correlation = Arc::new(Mutex::new(CorrelationTable::new()));
        let cancel = CancellationToken::new();

        let router = TrackRouter {
            participant: participant.clone(),
            correlation: correlation.clone(),
            media,
            bound: bound.clone(),
            emitter,
        };
        let handle = tokio::spawn(router.run(instance.events, cancel.clone()));

        Arc::new(Self {
            participant,
            negotiator: Negotiator::new(instance.set, Direction::Receive, ice_mode),
            correlation,
            negotiation: tokio::sync::Mutex::new(()),
            bound,
            cancel,
            router: Mutex::new(Some(handle)),
        })
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.negotiator.state()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn slot_for(&self, publication_id: &str) -> Option<SlotId> {
        lock(&self.correlation).slot_for(publication_id)
    }

    pub fn track_for(&self, publication_id: &str) -> Option<TrackHandle> {
        lock(&self.correlation).track_for(publication_id)
    }

    pub fn bindings(&self) -> Vec<SlotBinding> {
        lock(&self.correlation).bindings().to_vec()
    }

    pub fn unmatched_count(&self) -> usize {
        lock(&self.correlation).unmatched().len()
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

    fn unbound(&self, specs: &[PullSpec]) -> Vec<PullSpec> {
        let table = lock(&self.correlation);
        specs
            .iter()
            .filter(|s| !table.is_bound(&s.publication_id))
            .cloned()
            .collect()
    }

    fn needs_negotiation(&self, specs: &[PullSpec]) -> bool {
        let table = lock(&self.correlation);
        specs.iter().any(|s| !table.is_negotiated(&s.publication_id))
    }

    /// Offer the full slot set through `pull` and apply the answer. Must be
    /// called with the negotiation lock held.
    async fn negotiate(&self, signaling: &SignalingClient, room: &JoinedRoom) -> Result<(), RoomError> {
        let offer = self.cancellable(self.negotiator.create_offer()).await?;
        let all_specs = lock(&self.correlation).specs();
        let pulled = self
            .cancellable(signaling.pull(
                &room.room_id,
                &room.user_id,
                &self.participant,
                all_specs,
                offer,
            ))
            .await;
        let answer = match pulled {
            Ok(answer) => answer,
            Err(e) => {
                self.negotiator.rollback();
                return Err(e);
            }
        };
        self.cancellable(self.negotiator.apply_answer(&answer)).await?;
        lock(&self.correlation).mark_negotiated();
        info!("subscription to {} negotiated", self.participant);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn waiter_count(&self) -> usize {
        self.bound.receiver_count()
    }

    fn tracks_for(&self, specs: &[PullSpec]) -> Vec<TrackHandle> {
        let table = lock(&self.correlation);
        specs
            .iter()
            .filter_map(|s| table.track_for(&s.publication_id))
            .collect()
    }

    /// Receive `specs` from the participant.
    ///
    /// Reserves a slot for every spec not yet correlated and, unless every
    /// requested slot is already negotiated, re-offers the full slot set
    /// through `pull` and applies the answer. Then waits until every
    /// requested spec has a bound track. Returns the tracks in spec order.
    pub async fn subscribe(
        &self,
        specs: &[PullSpec],
        signaling: &SignalingClient,
        room: &JoinedRoom,
        timeout: Duration,
    ) -> Result<Vec<TrackHandle>, RoomError> {
        let mut requested: Vec<PullSpec> = Vec::with_capacity(specs.len());
        for spec in specs {
            if !requested.iter().any(|s| s.publication_id == spec.publication_id) {
                requested.push(spec.clone());
            }
        }
        if requested.is_empty() {
            return Err(RoomError::InvalidInput("no publications requested".into()));
        }
        if self.is_closed() {
            return Err(RoomError::Cancelled);
        }

        let mut bound_rx = self.bound.subscribe();

        {
            let _negotiating = tokio::select! {
                _ = self.cancel.cancelled() => return Err(RoomError::Cancelled),
                guard = self.negotiation.lock() => guard,
            };

            let fresh: Vec<PullSpec> = {
                let table = lock(&self.correlation);
                requested
                    .iter()
                    .filter(|s| !table.is_reserved(&s.publication_id))
                    .cloned()
                    .collect()
            };
            if !fresh.is_empty() {
                let kinds: Vec<MediaKind> = fresh.iter().map(|s| s.kind).collect();
                let slots = self
                    .cancellable(self.negotiator.add_receive_slots(&kinds))
                    .await?;
                let mut table = lock(&self.correlation);
                for (spec, slot) in fresh.iter().zip(slots) {
                    debug!("reserved slot {slot} for {} of {}", spec.publication_id, self.participant);
                    table.reserve(spec, slot);
                }
            }

            if self.needs_negotiation(&requested) {
                self.negotiate(signaling, room).await?;
            } else {
                debug!("{} already negotiated, waiting for tracks", self.participant);
            }
        }

        let wait = async {
            loop {
                if self.unbound(&requested).is_empty() {
                    return Ok(self.tracks_for(&requested));
                }
                if bound_rx.changed().await.is_err() {
                    return Err(RoomError::Cancelled);
                }
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(RoomError::Cancelled),
            res = tokio::time::timeout(timeout, wait) => match res {
                Ok(res) => res,
                Err(_) => Err(RoomError::Timeout),
            },
        }
    }

    /// Cancel any waiting subscribe and close the capability set.
    pub async fn close(&self) {
        self.cancel.cancel();
        let router = lock(&self.router).take();
        if let Some(router) = router {
            let _ = router.await;
        }
        self.negotiator.close().await;
        debug!("subscription to {} closed", self.participant);
    }
}
