//! Contract of the media-session primitive consumed by the orchestrator.
//!
//! One [`CapabilitySet`] instance exists per direction: a single send
//! instance for the local publish session and one receive instance per
//! subscribed remote participant. ICE, SDP generation and codec negotiation
//! are the implementation's business; the orchestrator only sequences the
//! offer/answer exchange through a [`Negotiator`].

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::errors::RoomError;
use crate::media::{CaptureStream, MediaConstraints, MediaKind, TrackHandle};

/// Negotiated media-line identifier of a reserved receive slot.
pub type SlotId = String;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("device access denied: {0}")]
    DeviceDenied(String),
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// How local ICE candidates reach the remote side.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum IceMode {
    /// Offer is sent right away; candidates are emitted as events.
    Trickle,
    /// Offer is sent only after gathering completes, candidates embedded.
    #[default]
    NonTrickle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub enum CapabilityEvent {
    /// An inbound track arrived on `slot`.
    Track { slot: SlotId, track: TrackHandle },
    IceCandidate(String),
    ConnectionStateChange(PeerState),
}

#[async_trait]
pub trait CapabilitySet: Send + Sync {
    async fn open_devices(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<CaptureStream, CapabilityError>;

    /// Reserve one receive-only slot per kind, returned in the same order.
    async fn add_receive_slots(&self, kinds: &[MediaKind]) -> Result<Vec<SlotId>, CapabilityError>;

    /// Create an offer covering every slot reserved so far and set it locally.
    async fn create_offer(&self) -> Result<String, CapabilityError>;

    /// Resolve once ICE gathering is complete, with the final local description.
    async fn gathering_complete(&self) -> Result<String, CapabilityError>;

    async fn apply_remote_answer(&self, sdp: &str) -> Result<(), CapabilityError>;

    async fn close(&self);
}

/// A freshly created capability set along with its event stream.
pub struct CapabilityInstance {
    pub set: Arc<dyn CapabilitySet>,
    pub events: mpsc::UnboundedReceiver<CapabilityEvent>,
}

#[async_trait]
pub trait CapabilityFactory: Send + Sync {
    async fn create(
        &self,
        direction: Direction,
        ice_servers: &[IceServer],
    ) -> Result<CapabilityInstance, CapabilityError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    HaveLocalOffer,
    Stable,
    Closed,
}

#[derive(Debug)]
struct NegotiationStatus {
    current: NegotiationState,
    /// Where a failed or rejected exchange falls back to.
    last_settled: NegotiationState,
}

/// Offer/answer state machine around one capability set.
///
/// Calls for one instance must be serialized by the owner (the publish lock
/// or a subscription's negotiation lock). A failed step returns the machine
/// to its last settled state so the session can be retried.
pub struct Negotiator {
    set: Arc<dyn CapabilitySet>,
    direction: Direction,
    ice_mode: IceMode,
    status: Mutex<NegotiationStatus>,
}

impl Negotiator {
    pub fn new(set: Arc<dyn CapabilitySet>, direction: Direction, ice_mode: IceMode) -> Self {
        Self {
            set,
            direction,
            ice_mode,
            status: Mutex::new(NegotiationStatus {
                current: NegotiationState::Idle,
                last_settled: NegotiationState::Idle,
            }),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> NegotiationState {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).current
    }

    fn set_state(&self, state: NegotiationState) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        status.current = state;
        if matches!(state, NegotiationState::Idle | NegotiationState::Stable) {
            status.last_settled = state;
        }
    }

    fn ensure_open(&self) -> Result<(), RoomError> {
        if self.state() == NegotiationState::Closed {
            return Err(RoomError::Negotiation("session closed".into()));
        }
        Ok(())
    }

    pub async fn open_devices(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<CaptureStream, RoomError> {
        self.ensure_open()?;
        if self.direction != Direction::Send {
            return Err(RoomError::Negotiation(
                "capture requires a send-configured session".into(),
            ));
        }
        Ok(self.set.open_devices(constraints).await?)
    }

    pub async fn add_receive_slots(&self, kinds: &[MediaKind]) -> Result<Vec<SlotId>, RoomError> {
        self.ensure_open()?;
        if self.direction != Direction::Receive {
            return Err(RoomError::Negotiation(
                "receive slots require a receive-configured session".into(),
            ));
        }
        let slots = self.set.add_receive_slots(kinds).await?;
        if slots.len() != kinds.len() {
            return Err(RoomError::Negotiation(format!(
                "requested {} slots, capability reserved {}",
                kinds.len(),
                slots.len()
            )));
        }
        Ok(slots)
    }

    /// Create the local offer, waiting for ICE gathering in non-trickle mode.
    pub async fn create_offer(&self) -> Result<String, RoomError> {
        match self.state() {
            NegotiationState::Idle | NegotiationState::Stable => {}
            NegotiationState::HaveLocalOffer => {
                return Err(RoomError::Negotiation("an offer is already pending".into()));
            }
            NegotiationState::Closed => {
                return Err(RoomError::Negotiation("session closed".into()));
            }
        }

        let mut sdp = self.set.create_offer().await?;
        if self.ice_mode == IceMode::NonTrickle {
            sdp = self.set.gathering_complete().await?;
        }
        // close() may have raced the awaits above
        self.ensure_open()?;
        self.set_state(NegotiationState::HaveLocalOffer);
        Ok(sdp)
    }

    pub async fn apply_answer(&self, sdp: &str) -> Result<(), RoomError> {
        if self.state() != NegotiationState::HaveLocalOffer {
            return Err(RoomError::Negotiation("no local offer pending".into()));
        }
        match self.set.apply_remote_answer(sdp).await {
            Ok(()) => {
                self.ensure_open()?;
                self.set_state(NegotiationState::Stable);
                Ok(())
            }
            Err(e) => {
                self.rollback();
                Err(e.into())
            }
        }
    }

    /// Abandon a pending offer, e.g. after the server rejected it.
    pub fn rollback(&self) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if status.current == NegotiationState::HaveLocalOffer {
            status.current = status.last_settled;
        }
    }

    pub async fn close(&self) {
        if self.state() == NegotiationState::Closed {
            return;
        }
        self.set_state(NegotiationState::Closed);
        self.set.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCapabilityFactory;

    async fn receive_negotiator(factory: &FakeCapabilityFactory, mode: IceMode) -> Negotiator {
        let instance = factory.create(Direction::Receive, &[]).await.unwrap();
        Negotiator::new(instance.set, Direction::Receive, mode)
    }

    #[tokio::test]
    async fn offer_answer_reaches_stable() {
        let factory = FakeCapabilityFactory::new();
        let neg = receive_negotiator(&factory, IceMode::Trickle).await;

        assert_eq!(neg.state(), NegotiationState::Idle);
        neg.add_receive_slots(&[MediaKind::Video]).await.unwrap();
        let offer = neg.create_offer().await.unwrap();
        assert!(offer.contains("m=video"));
        assert_eq!(neg.state(), NegotiationState::HaveLocalOffer);

        neg.apply_answer("answer").await.unwrap();
        assert_eq!(neg.state(), NegotiationState::Stable);
    }

    #[tokio::test]
    async fn second_offer_while_pending_is_rejected() {
        let factory = FakeCapabilityFactory::new();
        let neg = receive_negotiator(&factory, IceMode::Trickle).await;
        neg.create_offer().await.unwrap();
        assert!(matches!(neg.create_offer().await, Err(RoomError::Negotiation(_))));
    }

    #[tokio::test]
    async fn failed_answer_rolls_back_for_retry() {
        let factory = FakeCapabilityFactory::new();
        let neg = receive_negotiator(&factory, IceMode::Trickle).await;
        factory.fail_next_answer("bad answer");

        neg.create_offer().await.unwrap();
        assert!(matches!(neg.apply_answer("x").await, Err(RoomError::Negotiation(_))));
        assert_eq!(neg.state(), NegotiationState::Idle);

        // session still usable
        neg.create_offer().await.unwrap();
        neg.apply_answer("x").await.unwrap();
        assert_eq!(neg.state(), NegotiationState::Stable);
    }

    #[tokio::test]
    async fn rollback_returns_to_stable_after_renegotiation() {
        let factory = FakeCapabilityFactory::new();
        let neg = receive_negotiator(&factory, IceMode::Trickle).await;
        neg.create_offer().await.unwrap();
        neg.apply_answer("a").await.unwrap();

        neg.create_offer().await.unwrap();
        neg.rollback();
        assert_eq!(neg.state(), NegotiationState::Stable);
    }

    #[tokio::test]
    async fn non_trickle_uses_gathered_description() {
        let factory = FakeCapabilityFactory::new();
        let neg = receive_negotiator(&factory, IceMode::NonTrickle).await;
        let offer = neg.create_offer().await.unwrap();
        assert!(offer.contains("a=end-of-candidates"));
    }

    #[tokio::test]
    async fn direction_is_enforced() {
        let factory = FakeCapabilityFactory::new();
        let neg = receive_negotiator(&factory, IceMode::Trickle).await;
        let err = neg.open_devices(&MediaConstraints::default()).await.unwrap_err();
        assert!(matches!(err, RoomError::Negotiation(_)));
    }

    #[tokio::test]
    async fn closed_negotiator_refuses_work() {
        let factory = FakeCapabilityFactory::new();
        let neg = receive_negotiator(&factory, IceMode::Trickle).await;
        neg.close().await;
        assert_eq!(neg.state(), NegotiationState::Closed);
        assert!(neg.create_offer().await.is_err());
        assert!(neg.add_receive_slots(&[MediaKind::Audio]).await.is_err());
    }
}
