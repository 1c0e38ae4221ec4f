//! In-memory signaling server and capability sets.
//!
//! Used by the crate's tests and by the loopback simulator.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};

use crate::capability::{
    CapabilityError, CapabilityEvent, CapabilityFactory, CapabilityInstance, CapabilitySet,
    Direction, IceServer, PeerState, SlotId,
};
use crate::errors::RoomError;
use crate::identity::ParticipantId;
use crate::media::{CaptureStream, InboundMedia, MediaConstraints, MediaKind, MediaTrack, RenderSink};
use crate::protocol::{METHOD_HEARTBEAT, METHOD_JOIN, METHOD_PULL, METHOD_PUSH};
use crate::signaling::{RawNotification, SignalingChannel};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Poll `cond` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
}

impl FakeTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
        })
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct FakeControl {
    deny_devices: AtomicBool,
    fail_next_answer: Mutex<Option<String>>,
    fail_next_create: Mutex<Option<String>>,
    create_gate: Mutex<Option<Arc<Notify>>>,
}

pub struct FakeCapabilitySet {
    direction: Direction,
    control: Arc<FakeControl>,
    slots: Mutex<Vec<(SlotId, MediaKind)>>,
    offers: Mutex<Vec<String>>,
    answers: Mutex<Vec<String>>,
    open_calls: AtomicUsize,
    track_seq: AtomicUsize,
    closed: AtomicBool,
    events: mpsc::UnboundedSender<CapabilityEvent>,
}

impl FakeCapabilitySet {
    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn slots(&self) -> Vec<(SlotId, MediaKind)> {
        lock(&self.slots).clone()
    }

    pub fn offers(&self) -> Vec<String> {
        lock(&self.offers).clone()
    }

    pub fn answers(&self) -> Vec<String> {
        lock(&self.answers).clone()
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Simulate an inbound track arriving on `slot`.
    pub fn emit_track(&self, slot: &str, kind: MediaKind) -> Arc<FakeTrack> {
        let n = self.track_seq.fetch_add(1, Ordering::SeqCst);
        let track = FakeTrack::new(format!("track-{slot}-{n}"), kind);
        let _ = self.events.send(CapabilityEvent::Track {
            slot: slot.to_string(),
            track: track.clone(),
        });
        track
    }

    /// Emit a track on every reserved slot, matching each slot's kind.
    pub fn emit_all_tracks(&self) -> Vec<Arc<FakeTrack>> {
        self.slots()
            .into_iter()
            .map(|(slot, kind)| self.emit_track(&slot, kind))
            .collect()
    }

    pub fn emit_state(&self, state: PeerState) {
        let _ = self.events.send(CapabilityEvent::ConnectionStateChange(state));
    }

    fn describe(&self) -> String {
        let mut sdp = String::from("v=0\r\n");
        for (mid, kind) in lock(&self.slots).iter() {
            sdp.push_str(&format!("m={kind} 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:{mid}\r\na=recvonly\r\n"));
        }
        if self.direction == Direction::Send {
            sdp.push_str("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=sendonly\r\n");
            sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=sendonly\r\n");
        }
        sdp
    }
}

#[async_trait]
impl CapabilitySet for FakeCapabilitySet {
    async fn open_devices(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<CaptureStream, CapabilityError> {
        if self.control.deny_devices.load(Ordering::SeqCst) {
            return Err(CapabilityError::DeviceDenied("permission refused".into()));
        }
        let n = self.open_calls.fetch_add(1, Ordering::SeqCst);
        let mut tracks: Vec<crate::media::TrackHandle> = Vec::new();
        if constraints.audio {
            tracks.push(FakeTrack::new(format!("local-audio-{n}"), MediaKind::Audio));
        }
        if constraints.video {
            tracks.push(FakeTrack::new(format!("local-video-{n}"), MediaKind::Video));
        }
        Ok(CaptureStream {
            id: format!("capture-{n}"),
            tracks,
        })
    }

    async fn add_receive_slots(&self, kinds: &[MediaKind]) -> Result<Vec<SlotId>, CapabilityError> {
        let mut slots = lock(&self.slots);
        let mut reserved = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let mid = slots.len().to_string();
            slots.push((mid.clone(), *kind));
            reserved.push(mid);
        }
        Ok(reserved)
    }

    async fn create_offer(&self) -> Result<String, CapabilityError> {
        let sdp = self.describe();
        lock(&self.offers).push(sdp.clone());
        let _ = self
            .events
            .send(CapabilityEvent::IceCandidate("candidate:1 1 udp 1 127.0.0.1 9 typ host".into()));
        Ok(sdp)
    }

    async fn gathering_complete(&self) -> Result<String, CapabilityError> {
        let sdp = format!("{}a=end-of-candidates\r\n", self.describe());
        if let Some(last) = lock(&self.offers).last_mut() {
            *last = sdp.clone();
        }
        Ok(sdp)
    }

    async fn apply_remote_answer(&self, sdp: &str) -> Result<(), CapabilityError> {
        if let Some(msg) = lock(&self.control.fail_next_answer).take() {
            return Err(CapabilityError::Failed(msg));
        }
        lock(&self.answers).push(sdp.to_string());
        let _ = self
            .events
            .send(CapabilityEvent::ConnectionStateChange(PeerState::Connected));
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Creates [`FakeCapabilitySet`]s and keeps every instance for inspection.
#[derive(Clone, Default)]
pub struct FakeCapabilityFactory {
    control: Arc<FakeControl>,
    created: Arc<Mutex<Vec<Arc<FakeCapabilitySet>>>>,
}

impl FakeCapabilityFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_devices(&self, deny: bool) {
        self.control.deny_devices.store(deny, Ordering::SeqCst);
    }

    pub fn fail_next_answer(&self, msg: &str) {
        *lock(&self.control.fail_next_answer) = Some(msg.to_string());
    }

    pub fn fail_next_create(&self, msg: &str) {
        *lock(&self.control.fail_next_create) = Some(msg.to_string());
    }

    /// Park the next `create` until the returned gate is notified.
    pub fn hold_create(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *lock(&self.control.create_gate) = Some(gate.clone());
        gate
    }

    /// A `create` has picked up the gate from [`Self::hold_create`].
    pub fn create_held(&self) -> bool {
        lock(&self.control.create_gate).is_none()
    }

    pub fn sets(&self) -> Vec<Arc<FakeCapabilitySet>> {
        lock(&self.created).clone()
    }

    pub fn receive_sets(&self) -> Vec<Arc<FakeCapabilitySet>> {
        self.sets()
            .into_iter()
            .filter(|s| s.direction == Direction::Receive)
            .collect()
    }

    pub fn send_sets(&self) -> Vec<Arc<FakeCapabilitySet>> {
        self.sets()
            .into_iter()
            .filter(|s| s.direction == Direction::Send)
            .collect()
    }
}

#[async_trait]
impl CapabilityFactory for FakeCapabilityFactory {
    async fn create(
        &self,
        direction: Direction,
        _ice_servers: &[IceServer],
    ) -> Result<CapabilityInstance, CapabilityError> {
        if let Some(msg) = lock(&self.control.fail_next_create).take() {
            return Err(CapabilityError::Failed(msg));
        }
        let gate = lock(&self.control.create_gate).take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let set = Arc::new(FakeCapabilitySet {
            direction,
            control: self.control.clone(),
            slots: Mutex::new(Vec::new()),
            offers: Mutex::new(Vec::new()),
            answers: Mutex::new(Vec::new()),
            open_calls: AtomicUsize::new(0),
            track_seq: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            events: tx,
        });
        lock(&self.created).push(set.clone());
        Ok(CapabilityInstance { set, events: rx })
    }
}

#[derive(Default)]
struct SignalingState {
    scripted: HashMap<String, VecDeque<Result<Value, RoomError>>>,
    requests: Vec<(String, Value)>,
    notifies: Vec<(String, Value)>,
    inbound: Option<mpsc::UnboundedSender<RawNotification>>,
    open_error: Option<RoomError>,
    opened: usize,
    closed: usize,
}

/// Scripted signaling server.
///
/// Unscripted requests get a success response: `join` with an empty user
/// list, `push`/`pull` with the answer `"answer-sdp"`.
#[derive(Clone, Default)]
pub struct FakeSignaling {
    state: Arc<Mutex<SignalingState>>,
    gates: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
}

impl FakeSignaling {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot response for the next `method` request.
    pub fn respond(&self, method: &str, response: Value) {
        lock(&self.state)
            .scripted
            .entry(method.to_string())
            .or_default()
            .push_back(Ok(response));
    }

    /// Queue a one-shot failure for the next `method` request.
    pub fn fail(&self, method: &str, err: RoomError) {
        lock(&self.state)
            .scripted
            .entry(method.to_string())
            .or_default()
            .push_back(Err(err));
    }

    pub fn fail_open(&self, err: RoomError) {
        lock(&self.state).open_error = Some(err);
    }

    /// Hold the next `method` request until the returned handle is notified.
    pub fn hold(&self, method: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        lock(&self.gates).insert(method.to_string(), gate.clone());
        gate
    }

    /// Deliver a server notification. Returns false when the channel is not open.
    pub fn push_notification(&self, method: &str, data: Value) -> bool {
        let state = lock(&self.state);
        match &state.inbound {
            Some(tx) => tx
                .send(RawNotification {
                    method: method.to_string(),
                    data,
                })
                .is_ok(),
            None => false,
        }
    }

    pub fn requests(&self) -> Vec<(String, Value)> {
        lock(&self.state).requests.clone()
    }

    pub fn requests_for(&self, method: &str) -> Vec<(String, Value)> {
        self.requests()
            .into_iter()
            .filter(|(m, _)| m == method)
            .collect()
    }

    pub fn notifies(&self) -> Vec<(String, Value)> {
        lock(&self.state).notifies.clone()
    }

    pub fn open_count(&self) -> usize {
        lock(&self.state).opened
    }

    pub fn close_count(&self) -> usize {
        lock(&self.state).closed
    }

    fn default_response(method: &str) -> Result<Value, RoomError> {
        match method {
            METHOD_JOIN => Ok(json!({"code": 0, "users": []})),
            METHOD_PUSH | METHOD_PULL => Ok(json!({"code": 0, "sdp": "answer-sdp"})),
            METHOD_HEARTBEAT => Ok(json!({"code": 0})),
            other => Err(RoomError::Transport(format!("unsupported method {other}"))),
        }
    }
}

#[async_trait]
impl SignalingChannel for FakeSignaling {
    async fn open(&self) -> Result<mpsc::UnboundedReceiver<RawNotification>, RoomError> {
        let mut state = lock(&self.state);
        if let Some(err) = state.open_error.take() {
            return Err(err);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.inbound = Some(tx);
        state.opened += 1;
        Ok(rx)
    }

    async fn request(&self, method: &str, payload: Value) -> Result<Value, RoomError> {
        lock(&self.state)
            .requests
            .push((method.to_string(), payload));

        let gate = lock(&self.gates).remove(method);
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let scripted = lock(&self.state)
            .scripted
            .get_mut(method)
            .and_then(|q| q.pop_front());
        scripted.unwrap_or_else(|| Self::default_response(method))
    }

    async fn notify(&self, method: &str, payload: Value) -> Result<(), RoomError> {
        let mut state = lock(&self.state);
        if state.inbound.is_none() {
            return Err(RoomError::Transport("channel not open".into()));
        }
        state.notifies.push((method.to_string(), payload));
        Ok(())
    }

    async fn close(&self) {
        let mut state = lock(&self.state);
        state.inbound = None;
        state.closed += 1;
    }
}

/// Renderer double recording attach/detach calls.
#[derive(Default)]
pub struct RecordingSink {
    attached: Mutex<HashMap<ParticipantId, InboundMedia>>,
    detached: Mutex<Vec<ParticipantId>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn media_for(&self, id: &ParticipantId) -> Option<InboundMedia> {
        lock(&self.attached).get(id).cloned()
    }

    pub fn detached(&self) -> Vec<ParticipantId> {
        lock(&self.detached).clone()
    }
}

impl RenderSink for RecordingSink {
    fn attach(&self, participant: &ParticipantId, media: InboundMedia) {
        lock(&self.attached).insert(participant.clone(), media);
    }

    fn detach(&self, participant: &ParticipantId) {
        lock(&self.attached).remove(participant);
        lock(&self.detached).push(participant.clone());
    }
}
