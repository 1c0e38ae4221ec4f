use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capability::{CapabilityFactory, Direction};
use crate::chat::{ChatService, MessageStore};
use crate::errors::RoomError;
use crate::events::{
    ChatMessage, ConnectionState, ConnectivityState, EventEmitter, ListenerHandle,
    ParticipantInfo, RoomEvent, RoomEventListener,
};
use crate::identity::ParticipantId;
use crate::media::{InboundMedia, LocalStream, MediaConstraints, MediaKind, RenderSink, TrackHandle};
use crate::participants::{Participant, ParticipantTable};
use crate::protocol::{Notification, Publication, PullSpec, UserInfo};
use crate::publish::PublishSession;
use crate::settings::Settings;
use crate::signaling::{RawNotification, SignalingChannel, SignalingClient};
use crate::subscription::{SlotBinding, SubscriptionSession};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Identity of the local client inside the room it joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedRoom {
    pub room_id: String,
    pub user_id: ParticipantId,
    pub user_name: String,
}

struct ActiveRoom {
    room: JoinedRoom,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

enum Phase {
    Idle,
    Joining(CancellationToken),
    Joined(ActiveRoom),
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T, RoomError>>,
) -> Result<T, RoomError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(RoomError::Cancelled),
        res = fut => res,
    }
}

/// Close sessions and detach renderers of participants leaving the table.
async fn release(participants: Vec<Participant>) {
    let closing = participants.iter().filter_map(|p| p.subscription().cloned());
    join_all(closing.map(|s| async move { s.close().await })).await;
    for p in &participants {
        if let Some(renderer) = p.renderer() {
            renderer.detach(p.id());
        }
    }
}

enum Install {
    Installed(Arc<SubscriptionSession>),
    Raced(Arc<SubscriptionSession>, crate::capability::CapabilityInstance),
    Gone(crate::capability::CapabilityInstance),
    Cancelled(crate::capability::CapabilityInstance),
}

struct Inner {
    settings: Settings,
    signaling: SignalingClient,
    factory: Arc<dyn CapabilityFactory>,
    emitter: EventEmitter,
    phase: Mutex<Phase>,
    participants: Mutex<ParticipantTable>,
    publish: tokio::sync::Mutex<Option<Arc<PublishSession>>>,
    chat: ChatService,
}

/// Orchestrates one room session: membership, publish and subscriptions.
///
/// The membership table is only ever mutated here, by the public
/// operations and by the notification reducer task started on join.
#[derive(Clone)]
pub struct RoomManager {
    inner: Arc<Inner>,
}

impl RoomManager {
    pub fn new(
        settings: Settings,
        channel: Arc<dyn SignalingChannel>,
        factory: Arc<dyn CapabilityFactory>,
    ) -> Self {
        let emitter = EventEmitter::new();
        let messages: MessageStore = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        Self {
            inner: Arc::new(Inner {
                settings,
                signaling: SignalingClient::new(channel),
                factory,
                chat: ChatService::new(emitter.clone(), messages),
                emitter,
                phase: Mutex::new(Phase::Idle),
                participants: Mutex::new(ParticipantTable::new()),
                publish: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Register a listener for room events.
    pub fn add_listener(&self, listener: Arc<dyn RoomEventListener>) -> ListenerHandle {
        self.inner.emitter.add_listener(listener)
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn chat(&self) -> ChatService {
        self.inner.chat.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        match &*lock(&self.inner.phase) {
            Phase::Idle => ConnectionState::Disconnected,
            Phase::Joining(_) => ConnectionState::Joining,
            Phase::Joined(_) => ConnectionState::Joined,
        }
    }

    pub fn room(&self) -> Option<JoinedRoom> {
        self.inner.joined().ok()
    }

    /// Get a snapshot of current participants.
    pub fn participants(&self) -> Vec<ParticipantInfo> {
        lock(&self.inner.participants).snapshot()
    }

    pub fn participant(&self, id: &ParticipantId) -> Option<ParticipantInfo> {
        lock(&self.inner.participants).get(id).map(Participant::info)
    }

    pub fn inbound_media(&self, id: &ParticipantId) -> Option<InboundMedia> {
        lock(&self.inner.participants)
            .get(id)
            .map(|p| p.media().clone())
    }

    /// Slot correlation of the participant's subscription session.
    pub fn correlation(&self, id: &ParticipantId) -> Option<Vec<SlotBinding>> {
        let session = lock(&self.inner.participants)
            .get(id)
            .and_then(|p| p.subscription().cloned())?;
        Some(session.bindings())
    }

    pub async fn local_stream(&self) -> Option<LocalStream> {
        let publish = self.inner.publish.lock().await;
        publish.as_ref().and_then(|s| s.capture())
    }

    /// Join `room_id`, seed the table from the server's user list and start
    /// subscribing to everyone already publishing.
    pub async fn join(
        &self,
        room_id: &str,
        user_id: &ParticipantId,
        user_name: &str,
    ) -> Result<(), RoomError> {
        if room_id.trim().is_empty() || user_id.is_empty() {
            return Err(RoomError::InvalidInput("room id and user id are required".into()));
        }
        let cancel = CancellationToken::new();
        {
            let mut phase = lock(&self.inner.phase);
            match &*phase {
                Phase::Joining(_) => return Err(RoomError::JoinInFlight),
                Phase::Joined(_) => return Err(RoomError::AlreadyJoined),
                Phase::Idle => {}
            }
            *phase = Phase::Joining(cancel.clone());
        }
        self.inner
            .emitter
            .emit(RoomEvent::ConnectionStateChanged(ConnectionState::Joining));

        let room = JoinedRoom {
            room_id: room_id.to_string(),
            user_id: user_id.clone(),
            user_name: user_name.to_string(),
        };
        tracing::info!("joining room {room_id} as {user_id}");
        self.inner.join(room, cancel).await
    }

    /// Open local capture once and publish it to the room.
    pub async fn open_local_publish(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, RoomError> {
        let room = self.inner.joined()?;
        let session = {
            let mut publish = self.inner.publish.lock().await;
            match publish.as_ref() {
                Some(session) => session.clone(),
                None => {
                    let instance = self
                        .inner
                        .factory
                        .create(Direction::Send, &self.inner.settings.ice_servers)
                        .await?;
                    let session = PublishSession::start(
                        instance,
                        self.inner.settings.ice_mode,
                        self.inner.emitter.clone(),
                    );
                    *publish = Some(session.clone());
                    session
                }
            }
        };
        session
            .publish(constraints, &self.inner.signaling, &room)
            .await
    }

    /// Enable or disable the local capture tracks of `kind`.
    pub async fn set_local_track_enabled(&self, kind: MediaKind, enabled: bool) -> Result<(), RoomError> {
        let publish = self.inner.publish.lock().await;
        let session = publish
            .as_ref()
            .ok_or_else(|| RoomError::NotFound("no local publish session".into()))?;
        session.set_track_enabled(kind, enabled);
        Ok(())
    }

    /// Receive `specs` from a participant that already has a session.
    pub async fn subscribe(
        &self,
        participant_id: &ParticipantId,
        specs: &[PullSpec],
    ) -> Result<Vec<TrackHandle>, RoomError> {
        let room = self.inner.joined()?;
        let session = {
            let table = lock(&self.inner.participants);
            let participant = table
                .get(participant_id)
                .ok_or_else(|| RoomError::NotFound(format!("participant {participant_id}")))?;
            for spec in specs {
                match participant.publication(&spec.publication_id) {
                    Some(p) if p.kind == spec.kind => {}
                    _ => {
                        return Err(RoomError::NotFound(format!(
                            "{} publication {} of {participant_id}",
                            spec.kind, spec.publication_id
                        )));
                    }
                }
            }
            participant.subscription().cloned().ok_or_else(|| {
                RoomError::NotFound(format!("subscription session for {participant_id}"))
            })?
        };
        session
            .subscribe(
                specs,
                &self.inner.signaling,
                &room,
                self.inner.settings.subscribe_timeout(),
            )
            .await
    }

    /// Set the local rendering mute flag for one media kind of a participant.
    pub fn set_mute(
        &self,
        participant_id: &ParticipantId,
        kind: MediaKind,
        muted: bool,
    ) -> Result<(), RoomError> {
        let touched = {
            let table = lock(&self.inner.participants);
            let participant = table
                .get(participant_id)
                .ok_or_else(|| RoomError::NotFound(format!("participant {participant_id}")))?;
            participant.media().set_muted(kind, muted)
        };
        tracing::debug!("{participant_id} {kind} muted={muted} ({touched} tracks)");
        self.inner.emitter.emit(RoomEvent::MuteChanged {
            participant: participant_id.clone(),
            kind,
            muted,
        });
        Ok(())
    }

    /// Bind a renderer to the participant's inbound media, replacing any
    /// previous one.
    pub fn attach_renderer(
        &self,
        participant_id: &ParticipantId,
        sink: Arc<dyn RenderSink>,
    ) -> Result<(), RoomError> {
        let (media, previous) = {
            let mut table = lock(&self.inner.participants);
            let participant = table
                .get_mut(participant_id)
                .ok_or_else(|| RoomError::NotFound(format!("participant {participant_id}")))?;
            let media = participant.media().clone();
            (media, participant.set_renderer(sink.clone()))
        };
        if let Some(previous) = previous {
            previous.detach(participant_id);
        }
        sink.attach(participant_id, media);
        Ok(())
    }

    pub async fn send_chat(&self, text: &str) -> Result<ChatMessage, RoomError> {
        let room = self.inner.joined()?;
        self.inner
            .chat
            .send_message(&self.inner.signaling, &room, text)
            .await
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.inner.chat.messages().await
    }

    /// Leave the room, tearing down every session.
    ///
    /// A join still in flight is cancelled and cleans up after itself.
    pub async fn leave(&self) {
        let active = {
            let mut phase = lock(&self.inner.phase);
            if let Phase::Joining(cancel) = &*phase {
                cancel.cancel();
                return;
            }
            match std::mem::replace(&mut *phase, Phase::Idle) {
                Phase::Joined(active) => active,
                _ => return,
            }
        };

        tracing::info!("leaving room {}", active.room.room_id);
        active.cancel.cancel();
        join_all(active.tasks).await;

        let participants = lock(&self.inner.participants).drain();
        release(participants).await;

        let publish = self.inner.publish.lock().await.take();
        if let Some(publish) = publish {
            publish.close().await;
        }

        self.inner.signaling.close().await;
        self.inner.chat.clear().await;
        self.inner
            .emitter
            .emit(RoomEvent::ConnectionStateChanged(ConnectionState::Disconnected));
    }
}

impl Inner {
    fn joined(&self) -> Result<JoinedRoom, RoomError> {
        match &*lock(&self.phase) {
            Phase::Joined(active) => Ok(active.room.clone()),
            _ => Err(RoomError::NotJoined),
        }
    }

    async fn join(self: &Arc<Self>, room: JoinedRoom, cancel: CancellationToken) -> Result<(), RoomError> {
        let (events, staged) = match self.establish(&room, &cancel).await {
            Ok(established) => established,
            Err(e) => {
                tracing::warn!("join {} failed: {e}", room.room_id);
                self.abandon_join().await;
                return Err(e);
            }
        };

        let infos = staged.snapshot();
        let initial: Vec<(ParticipantId, Vec<PullSpec>)> = staged
            .iter()
            .filter(|p| p.subscription().is_some())
            .map(|p| (p.id().clone(), p.specs()))
            .collect();

        let committed = {
            let mut phase = lock(&self.phase);
            if cancel.is_cancelled() {
                Err(staged)
            } else {
                *lock(&self.participants) = staged;
                let tasks = self.start_tasks(events, &room, &cancel);
                *phase = Phase::Joined(ActiveRoom {
                    room: room.clone(),
                    cancel: cancel.clone(),
                    tasks,
                });
                Ok(())
            }
        };
        if let Err(mut staged) = committed {
            release(staged.drain()).await;
            self.abandon_join().await;
            return Err(RoomError::Cancelled);
        }

        tracing::info!("joined room {} with {} participants", room.room_id, infos.len());
        for info in infos {
            self.emitter.emit(RoomEvent::ParticipantJoined(info));
        }
        self.emitter
            .emit(RoomEvent::ConnectionStateChanged(ConnectionState::Joined));
        for (id, specs) in initial {
            self.spawn_subscribe(id, specs, &room, &cancel);
        }
        Ok(())
    }

    /// Open the channel, send `join` and stage the participant table.
    /// Nothing here is visible outside until the caller commits.
    async fn establish(
        &self,
        room: &JoinedRoom,
        cancel: &CancellationToken,
    ) -> Result<(mpsc::UnboundedReceiver<RawNotification>, ParticipantTable), RoomError> {
        let events = cancellable(cancel, self.signaling.open()).await?;
        let resp = cancellable(
            cancel,
            self.signaling
                .join(&room.room_id, &room.user_id, &room.user_name),
        )
        .await?;

        let mut staged = ParticipantTable::new();
        for user in resp.users.iter().filter(|u| u.user_id != room.user_id) {
            staged.upsert(user);
        }

        let pending: Vec<ParticipantId> = staged
            .iter()
            .filter(|p| p.needs_subscription())
            .map(|p| p.id().clone())
            .collect();
        for id in pending {
            let created = cancellable(cancel, async {
                self.factory
                    .create(Direction::Receive, &self.settings.ice_servers)
                    .await
                    .map_err(RoomError::from)
            })
            .await;
            let instance = match created {
                Ok(instance) => instance,
                Err(e) => {
                    release(staged.drain()).await;
                    return Err(e);
                }
            };
            if let Some(participant) = staged.get_mut(&id) {
                let session = SubscriptionSession::start(
                    id.clone(),
                    instance,
                    self.settings.ice_mode,
                    participant.media().clone(),
                    self.emitter.clone(),
                );
                participant.set_subscription(session);
            }
        }
        Ok((events, staged))
    }

    async fn abandon_join(&self) {
        self.signaling.close().await;
        *lock(&self.phase) = Phase::Idle;
        self.emitter
            .emit(RoomEvent::ConnectionStateChanged(ConnectionState::Disconnected));
    }

    fn start_tasks(
        self: &Arc<Self>,
        events: mpsc::UnboundedReceiver<RawNotification>,
        room: &JoinedRoom,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![tokio::spawn(self.clone().run_reducer(
            events,
            room.clone(),
            cancel.clone(),
        ))];
        match self.settings.heartbeat_interval() {
            Some(interval) => tasks.push(tokio::spawn(run_heartbeat(
                self.signaling.clone(),
                room.clone(),
                interval,
                cancel.clone(),
            ))),
            None => tracing::debug!("heartbeat disabled"),
        }
        tasks
    }

    async fn run_reducer(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<RawNotification>,
        room: JoinedRoom,
        cancel: CancellationToken,
    ) {
        loop {
            let raw = tokio::select! {
                _ = cancel.cancelled() => break,
                raw = events.recv() => match raw {
                    Some(raw) => raw,
                    None => {
                        tracing::warn!("signaling notification stream closed");
                        self.emitter.emit(RoomEvent::SignalingLost);
                        break;
                    }
                },
            };
            match Notification::parse(&raw) {
                Ok(Some(notification)) => self.reduce(notification, &room, &cancel).await,
                Ok(None) => tracing::debug!("ignoring notification {}", raw.method),
                Err(e) => tracing::warn!("malformed {} notification: {e}", raw.method),
            }
        }
        tracing::debug!("notification reducer stopped");
    }

    async fn reduce(
        self: &Arc<Self>,
        notification: Notification,
        room: &JoinedRoom,
        cancel: &CancellationToken,
    ) {
        match notification {
            Notification::NewUser(users) => self.merge_users(&users, room, cancel),
            Notification::NewPusher(user) => {
                self.merge_users(std::slice::from_ref(&user), room, cancel)
            }
            Notification::UserDisconnect(id) => {
                self.set_connectivity(id, ConnectivityState::Disconnected)
            }
            Notification::UserReconnect(id) => self.set_connectivity(id, ConnectivityState::Connected),
            Notification::UserLeave(id) => {
                let removed = lock(&self.participants).remove(&id);
                match removed {
                    Some(participant) => {
                        tracing::info!("participant {id} left");
                        release(vec![participant]).await;
                        self.emitter.emit(RoomEvent::ParticipantLeft(id));
                    }
                    None => tracing::debug!("userLeave for unknown participant {id}"),
                }
            }
            Notification::TextMessage(text) => {
                self.chat.handle_incoming(text).await;
            }
        }
    }

    /// Upsert announced users and subscribe to every newly added publication.
    fn merge_users(self: &Arc<Self>, users: &[UserInfo], room: &JoinedRoom, cancel: &CancellationToken) {
        let mut events = Vec::new();
        let mut subscribe = Vec::new();
        {
            let mut table = lock(&self.participants);
            for user in users.iter().filter(|u| u.user_id != room.user_id) {
                let outcome = table.upsert(user);
                let Some(participant) = table.get(&user.user_id) else {
                    continue;
                };
                events.push(if outcome.created {
                    RoomEvent::ParticipantJoined(participant.info())
                } else {
                    RoomEvent::ParticipantUpdated(participant.info())
                });
                if !outcome.added.is_empty() {
                    let specs = outcome.added.iter().map(Publication::spec).collect();
                    subscribe.push((participant.id().clone(), specs));
                    events.push(RoomEvent::PublicationsAdded {
                        participant: participant.id().clone(),
                        publications: outcome.added,
                    });
                }
            }
        }
        for event in events {
            self.emitter.emit(event);
        }
        for (id, specs) in subscribe {
            self.spawn_subscribe(id, specs, room, cancel);
        }
    }

    fn set_connectivity(&self, id: ParticipantId, state: ConnectivityState) {
        if !lock(&self.participants).set_state(&id, state) {
            tracing::debug!("connectivity change for unknown participant {id}");
            return;
        }
        tracing::debug!("participant {id} is {state:?}");
        self.emitter.emit(RoomEvent::ConnectivityChanged {
            participant: id,
            state,
        });
    }

    /// Run a subscribe off the reducer; failures become events.
    ///
    /// The task belongs to the room it was spawned for and stops when that
    /// room's token is cancelled.
    fn spawn_subscribe(
        self: &Arc<Self>,
        id: ParticipantId,
        specs: Vec<PullSpec>,
        room: &JoinedRoom,
        cancel: &CancellationToken,
    ) {
        let inner = self.clone();
        let room = room.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let outcome =
                cancellable(&cancel, inner.subscribe_with_session(&id, &specs, &room, &cancel)).await;
            match outcome {
                Ok(tracks) => tracing::debug!("received {} tracks from {id}", tracks.len()),
                Err(RoomError::Cancelled) => tracing::debug!("subscription to {id} cancelled"),
                Err(e) if cancel.is_cancelled() => {
                    tracing::debug!("subscription to {id} dropped after leave: {e}")
                }
                Err(e) => {
                    tracing::warn!("subscribe to {id} failed: {e}");
                    inner.emitter.emit(RoomEvent::SubscribeFailed {
                        participant: id,
                        error: e,
                    });
                }
            }
        });
    }

    async fn subscribe_with_session(
        &self,
        id: &ParticipantId,
        specs: &[PullSpec],
        room: &JoinedRoom,
        cancel: &CancellationToken,
    ) -> Result<Vec<TrackHandle>, RoomError> {
        let session = self.ensure_session(id, cancel).await?;
        session
            .subscribe(specs, &self.signaling, room, self.settings.subscribe_timeout())
            .await
    }

    /// The participant's session, creating it on first use.
    ///
    /// Nothing is installed once `cancel` fires: the table may already
    /// belong to a later room.
    async fn ensure_session(
        &self,
        id: &ParticipantId,
        cancel: &CancellationToken,
    ) -> Result<Arc<SubscriptionSession>, RoomError> {
        {
            let table = lock(&self.participants);
            if cancel.is_cancelled() {
                return Err(RoomError::Cancelled);
            }
            let participant = table
                .get(id)
                .ok_or_else(|| RoomError::NotFound(format!("participant {id}")))?;
            if let Some(session) = participant.subscription() {
                return Ok(session.clone());
            }
        }

        let instance = self
            .factory
            .create(Direction::Receive, &self.settings.ice_servers)
            .await?;

        let install = {
            let mut table = lock(&self.participants);
            match table.get_mut(id) {
                _ if cancel.is_cancelled() => Install::Cancelled(instance),
                None => Install::Gone(instance),
                Some(participant) => match participant.subscription() {
                    Some(existing) => Install::Raced(existing.clone(), instance),
                    None => {
                        let session = SubscriptionSession::start(
                            participant.id().clone(),
                            instance,
                            self.settings.ice_mode,
                            participant.media().clone(),
                            self.emitter.clone(),
                        );
                        participant.set_subscription(session.clone());
                        Install::Installed(session)
                    }
                },
            }
        };

        match install {
            Install::Installed(session) => {
                tracing::debug!("subscription session created for {id}");
                Ok(session)
            }
            Install::Raced(existing, spare) => {
                spare.set.close().await;
                Ok(existing)
            }
            Install::Gone(spare) => {
                spare.set.close().await;
                Err(RoomError::NotFound(format!("participant {id}")))
            }
            Install::Cancelled(spare) => {
                spare.set.close().await;
                Err(RoomError::Cancelled)
            }
        }
    }
}

async fn run_heartbeat(
    signaling: SignalingClient,
    room: JoinedRoom,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let signaling = signaling.clone();
                let room = room.clone();
                tokio::spawn(async move {
                    if let Err(e) = signaling
                        .heartbeat(&room.room_id, &room.user_id, &room.user_name)
                        .await
                    {
                        tracing::warn!("heartbeat failed: {e}");
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::IceMode;
    use crate::events::MessageOrigin;
    use crate::media::MediaTrack;
    use crate::protocol::{
        METHOD_HEARTBEAT, METHOD_JOIN, METHOD_PULL, METHOD_PUSH, NOTIFY_NEW_PUSHER,
        NOTIFY_NEW_USER, NOTIFY_TEXT_MESSAGE, NOTIFY_USER_DISCONNECT, NOTIFY_USER_LEAVE,
        NOTIFY_USER_RECONNECT,
    };
    use crate::testing::{FakeCapabilityFactory, FakeSignaling, RecordingSink, eventually};
    use serde_json::{Value, json};

    const WAIT: Duration = Duration::from_secs(2);

    #[derive(Default)]
    struct EventLog {
        events: Mutex<Vec<RoomEvent>>,
    }

    impl RoomEventListener for EventLog {
        fn on_event(&self, event: RoomEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl EventLog {
        fn any(&self, pred: impl Fn(&RoomEvent) -> bool) -> bool {
            self.events.lock().unwrap().iter().any(pred)
        }

        fn subscribe_failures(&self) -> Vec<RoomError> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    RoomEvent::SubscribeFailed { error, .. } => Some(error.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    struct Harness {
        fake_sig: FakeSignaling,
        factory: FakeCapabilityFactory,
        room: RoomManager,
        log: Arc<EventLog>,
    }

    fn test_settings() -> Settings {
        Settings {
            ice_mode: IceMode::Trickle,
            heartbeat_interval_ms: 0,
            subscribe_timeout_ms: 2_000,
            ..Settings::default()
        }
    }

    fn harness_with(settings: Settings) -> Harness {
        let fake_sig = FakeSignaling::new();
        let factory = FakeCapabilityFactory::new();
        let room = RoomManager::new(
            settings,
            Arc::new(fake_sig.clone()),
            Arc::new(factory.clone()),
        );
        let log = Arc::new(EventLog::default());
        room.add_listener(log.clone());
        Harness {
            fake_sig,
            factory,
            room,
            log,
        }
    }

    async fn joined_with(users: Value) -> Harness {
        let h = harness_with(test_settings());
        h.fake_sig
            .respond(METHOD_JOIN, json!({"code": 0, "users": users}));
        h.room.join("room", &"me".into(), "Me").await.unwrap();
        h
    }

    fn publisher(id: &str, pushers: Value) -> Value {
        json!({"userId": id, "userName": "Alice", "pushers": pushers})
    }

    impl Harness {
        async fn wait_for_pulls(&self, n: usize) {
            assert!(
                eventually(WAIT, || self.fake_sig.requests_for(METHOD_PULL).len() >= n).await,
                "expected {n} pull requests"
            );
        }

        async fn wait_for_answers(&self, set: usize, n: usize) {
            assert!(
                eventually(WAIT, || {
                    self.factory
                        .receive_sets()
                        .get(set)
                        .is_some_and(|s| s.answers().len() >= n)
                })
                .await
            );
        }

        fn session(&self, id: &str) -> Arc<SubscriptionSession> {
            lock(&self.room.inner.participants)
                .get(&id.into())
                .and_then(|p| p.subscription().cloned())
                .unwrap()
        }

        fn media(&self, id: &str) -> InboundMedia {
            self.room.inbound_media(&id.into()).unwrap()
        }
    }

    #[tokio::test]
    async fn join_without_publications_creates_no_session() {
        let h = joined_with(json!([{"userId": "6725", "pushers": []}])).await;

        assert_eq!(h.room.connection_state(), ConnectionState::Joined);
        let participants = h.room.participants();
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].id, ParticipantId::new("6725"));
        assert!(!participants[0].subscribed);
        assert!(h.factory.receive_sets().is_empty());
        assert!(h.log.any(|e| matches!(e, RoomEvent::ParticipantJoined(_))));
    }

    #[tokio::test]
    async fn join_skips_local_user_in_user_list() {
        let h = joined_with(json!([{"userId": " ME ", "pushers": []}, {"userId": 1}])).await;
        let ids: Vec<_> = h.room.participants().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![ParticipantId::new("1")]);
    }

    #[tokio::test]
    async fn join_subscribes_to_existing_publishers() {
        let h = joined_with(json!([publisher("6725", json!([{"id": "p1", "type": "video"}]))])).await;

        assert!(h.room.participant(&"6725".into()).unwrap().subscribed);
        h.wait_for_answers(0, 1).await;
        h.factory.receive_sets()[0].emit_track("0", MediaKind::Video);

        assert!(eventually(WAIT, || h.media("6725").len() == 1).await);
        assert!(eventually(WAIT, || h.log.any(|e| matches!(e, RoomEvent::TrackBound(_)))).await);
    }

    #[tokio::test]
    async fn server_ids_reach_the_wire_unchanged() {
        let h = harness_with(test_settings());
        h.fake_sig.respond(
            METHOD_JOIN,
            json!({"code": 0, "users": [
                publisher("AliceX", json!([{"id": "p1", "type": "video"}])),
                {"userId": 6725, "userName": "Bob", "pushers": [{"id": "b1", "type": "audio"}]},
            ]}),
        );
        h.room.join("room", &"MeUser".into(), "Me").await.unwrap();
        h.wait_for_pulls(2).await;

        let (_, join) = h.fake_sig.requests_for(METHOD_JOIN).remove(0);
        assert_eq!(join["userId"], "MeUser");

        let pulls: Vec<Value> = h
            .fake_sig
            .requests_for(METHOD_PULL)
            .into_iter()
            .map(|(_, payload)| payload)
            .collect();
        assert!(pulls.iter().all(|p| p["userId"] == "MeUser"));
        let targets: Vec<Value> = pulls.iter().map(|p| p["targetUserId"].clone()).collect();
        assert!(targets.contains(&json!("AliceX")));
        assert!(targets.contains(&json!(6725)));

        assert!(h.room.participant(&"alicex".into()).is_some());
        assert!(h.room.participant(&" 6725".into()).is_some());
    }

    #[tokio::test]
    async fn rejected_join_leaves_no_state() {
        let h = harness_with(test_settings());
        h.fake_sig
            .respond(METHOD_JOIN, json!({"code": 5, "message": "no such room"}));
        let err = h.room.join("room", &"me".into(), "Me").await.unwrap_err();
        assert!(matches!(err, RoomError::ServerRejected { code: 5, .. }));
        assert_eq!(h.room.connection_state(), ConnectionState::Disconnected);
        assert!(h.room.participants().is_empty());
        assert_eq!(h.fake_sig.close_count(), 1);

        h.room.join("room", &"me".into(), "Me").await.unwrap();
        assert_eq!(h.room.connection_state(), ConnectionState::Joined);
    }

    #[tokio::test]
    async fn channel_open_failure_surfaces() {
        let h = harness_with(test_settings());
        h.fake_sig
            .fail_open(RoomError::Transport("connection refused".into()));
        let err = h.room.join("room", &"me".into(), "Me").await.unwrap_err();
        assert_eq!(err, RoomError::Transport("connection refused".into()));
        assert!(h.fake_sig.requests_for(METHOD_JOIN).is_empty());
        assert_eq!(h.room.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn failed_session_creation_aborts_join() {
        let h = harness_with(test_settings());
        h.fake_sig.respond(
            METHOD_JOIN,
            json!({"code": 0, "users": [publisher("a", json!([{"id": "p1", "type": "audio"}]))]}),
        );
        h.factory.fail_next_create("no capability");
        let err = h.room.join("room", &"me".into(), "Me").await.unwrap_err();
        assert!(matches!(err, RoomError::Negotiation(_)));
        assert!(h.room.participants().is_empty());
        assert_eq!(h.room.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn concurrent_join_is_rejected() {
        let h = harness_with(test_settings());
        let gate = h.fake_sig.hold(METHOD_JOIN);
        let room = h.room.clone();
        let first = tokio::spawn(async move { room.join("room", &"me".into(), "Me").await });
        assert!(eventually(WAIT, || h.fake_sig.requests_for(METHOD_JOIN).len() == 1).await);

        assert_eq!(
            h.room.join("room", &"me".into(), "Me").await,
            Err(RoomError::JoinInFlight)
        );
        assert_eq!(h.room.connection_state(), ConnectionState::Joining);

        gate.notify_one();
        first.await.unwrap().unwrap();
        assert_eq!(
            h.room.join("room", &"me".into(), "Me").await,
            Err(RoomError::AlreadyJoined)
        );
    }

    #[tokio::test]
    async fn leave_during_join_cancels_it() {
        let h = harness_with(test_settings());
        let _gate = h.fake_sig.hold(METHOD_JOIN);
        let room = h.room.clone();
        let join = tokio::spawn(async move { room.join("room", &"me".into(), "Me").await });
        assert!(eventually(WAIT, || h.fake_sig.requests_for(METHOD_JOIN).len() == 1).await);

        h.room.leave().await;
        assert_eq!(join.await.unwrap(), Err(RoomError::Cancelled));
        assert_eq!(h.room.connection_state(), ConnectionState::Disconnected);
        assert!(h.room.participants().is_empty());
    }

    #[tokio::test]
    async fn new_pusher_subscribes_to_its_publication() {
        let h = joined_with(json!([{"userId": "6725", "pushers": []}])).await;

        assert!(h.fake_sig.push_notification(
            NOTIFY_NEW_PUSHER,
            publisher("6725", json!([{"id": "p1", "type": "video"}])),
        ));
        h.wait_for_pulls(1).await;
        let (_, pull) = h.fake_sig.requests_for(METHOD_PULL).remove(0);
        assert_eq!(pull["specs"], json!([{"type": "video", "pusher_id": "p1"}]));

        h.wait_for_answers(0, 1).await;
        h.factory.receive_sets()[0].emit_track("0", MediaKind::Video);
        assert!(eventually(WAIT, || h.media("6725").tracks_of(MediaKind::Video).len() == 1).await);
        assert_eq!(h.media("6725").len(), 1);

        // subsequent subscribe for the bound publication needs no round trip
        let tracks = h
            .room
            .subscribe(&"6725".into(), &[PullSpec::new(MediaKind::Video, "p1")])
            .await
            .unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(h.fake_sig.requests_for(METHOD_PULL).len(), 1);
        assert!(h.log.subscribe_failures().is_empty());
    }

    #[tokio::test]
    async fn known_publication_merge_triggers_no_new_slots() {
        let h = joined_with(json!([publisher("6725", json!([{"id": "p1", "type": "video"}]))])).await;
        h.wait_for_answers(0, 1).await;
        let set = h.factory.receive_sets().remove(0);
        set.emit_track("0", MediaKind::Video);
        assert!(eventually(WAIT, || h.media("6725").len() == 1).await);

        h.fake_sig.push_notification(
            NOTIFY_NEW_PUSHER,
            publisher("6725", json!([{"id": "p1", "type": "video"}])),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.fake_sig.requests_for(METHOD_PULL).len(), 1);
        assert_eq!(set.slots().len(), 1);

        h.fake_sig.push_notification(
            NOTIFY_NEW_PUSHER,
            publisher(
                "6725",
                json!([{"id": "p1", "type": "video"}, {"id": "p2", "type": "audio"}]),
            ),
        );
        h.wait_for_pulls(2).await;
        assert_eq!(set.slots().len(), 2);
        let (_, pull) = h.fake_sig.requests_for(METHOD_PULL).remove(1);
        assert_eq!(
            pull["specs"],
            json!([{"type": "video", "pusher_id": "p1"}, {"type": "audio", "pusher_id": "p2"}])
        );
        assert_eq!(h.room.participant(&"6725".into()).unwrap().publications.len(), 2);
    }

    #[tokio::test]
    async fn rejected_pull_fails_subscribe_and_keeps_reservation() {
        let h = harness_with(test_settings());
        h.fake_sig.respond(
            METHOD_JOIN,
            json!({"code": 0, "users": [publisher("6725", json!([{"id": "p1", "type": "video"}]))]}),
        );
        h.fake_sig
            .respond(METHOD_PULL, json!({"code": 1, "message": "room full"}));
        h.room.join("room", &"me".into(), "Me").await.unwrap();

        assert!(eventually(WAIT, || !h.log.subscribe_failures().is_empty()).await);
        assert_eq!(
            h.log.subscribe_failures(),
            vec![RoomError::ServerRejected {
                code: 1,
                message: "room full".into()
            }]
        );
        let bindings = h.room.correlation(&"6725".into()).unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].slot, "0");
        assert!(bindings[0].track.is_none());
        assert!(h.media("6725").is_empty());

        // retry reuses the reserved slot
        let room = h.room.clone();
        let retry = tokio::spawn(async move {
            room.subscribe(&"6725".into(), &[PullSpec::new(MediaKind::Video, "p1")])
                .await
        });
        h.wait_for_answers(0, 1).await;
        let set = h.factory.receive_sets().remove(0);
        assert_eq!(set.slots().len(), 1);
        set.emit_track("0", MediaKind::Video);
        assert_eq!(retry.await.unwrap().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn latest_announced_name_wins() {
        let h = joined_with(json!([])).await;
        h.fake_sig.push_notification(
            NOTIFY_NEW_USER,
            json!([{"userId": "6725", "userName": "first", "pushers": []}]),
        );
        h.fake_sig.push_notification(
            NOTIFY_NEW_USER,
            json!([{"userId": 6725, "userName": "second", "pushers": []}]),
        );
        assert!(
            eventually(WAIT, || {
                h.room
                    .participant(&"6725".into())
                    .is_some_and(|p| p.name == "second")
            })
            .await
        );
        assert_eq!(h.room.participants().len(), 1);
    }

    #[tokio::test]
    async fn mute_during_negotiation_applies_to_arriving_tracks() {
        let h = joined_with(json!([publisher(
            "6725",
            json!([{"id": "a1", "type": "audio"}, {"id": "v1", "type": "video"}])
        )]))
        .await;
        h.wait_for_answers(0, 1).await;

        h.room.set_mute(&"6725".into(), MediaKind::Audio, true).unwrap();
        let set = h.factory.receive_sets().remove(0);
        let audio = set.emit_track("0", MediaKind::Audio);
        let video = set.emit_track("1", MediaKind::Video);
        assert!(eventually(WAIT, || h.media("6725").len() == 2).await);
        assert!(!audio.is_enabled());
        assert!(video.is_enabled());

        h.room.set_mute(&"6725".into(), MediaKind::Audio, false).unwrap();
        assert!(audio.is_enabled());
        // idempotent
        h.room.set_mute(&"6725".into(), MediaKind::Audio, false).unwrap();
        assert!(audio.is_enabled());
        assert!(!h.room.participant(&"6725".into()).unwrap().audio_muted);
    }

    #[tokio::test]
    async fn mute_unknown_participant_is_not_found() {
        let h = joined_with(json!([])).await;
        let err = h
            .room
            .set_mute(&"ghost".into(), MediaKind::Video, true)
            .unwrap_err();
        assert!(matches!(err, RoomError::NotFound(_)));
    }

    #[tokio::test]
    async fn user_leave_cancels_in_flight_subscribe_and_cleans_up() {
        let h = joined_with(json!([publisher("6725", json!([{"id": "p1", "type": "video"}]))])).await;
        let sink = RecordingSink::new();
        h.room.attach_renderer(&"6725".into(), sink.clone()).unwrap();
        assert!(sink.media_for(&"6725".into()).is_some());

        // joins the background subscribe's wait without a second pull
        h.wait_for_answers(0, 1).await;
        let room = h.room.clone();
        let pending = tokio::spawn(async move {
            room.subscribe(&"6725".into(), &[PullSpec::new(MediaKind::Video, "p1")])
                .await
        });
        let session = h.session("6725");
        assert!(eventually(WAIT, || session.waiter_count() == 2).await);
        assert_eq!(h.fake_sig.requests_for(METHOD_PULL).len(), 1);

        h.fake_sig
            .push_notification(NOTIFY_USER_LEAVE, json!({"userId": "6725"}));
        assert_eq!(pending.await.unwrap().unwrap_err(), RoomError::Cancelled);

        assert!(h.room.participant(&"6725".into()).is_none());
        assert_eq!(sink.detached(), vec![ParticipantId::new("6725")]);
        assert!(sink.media_for(&"6725".into()).is_none());
        assert!(h.factory.receive_sets()[0].is_closed());
        assert!(h.log.any(|e| matches!(e, RoomEvent::ParticipantLeft(_))));
        assert!(h.log.subscribe_failures().is_empty());
    }

    #[tokio::test]
    async fn background_subscribe_stays_with_the_room_it_started_in() {
        let h = joined_with(json!([])).await;
        let gate = h.factory.hold_create();
        h.fake_sig.push_notification(
            NOTIFY_NEW_PUSHER,
            publisher("6725", json!([{"id": "p1", "type": "video"}])),
        );
        assert!(eventually(WAIT, || h.factory.create_held()).await);

        h.room.leave().await;
        h.fake_sig.respond(
            METHOD_JOIN,
            json!({"code": 0, "users": [publisher("6725", json!([{"id": "p1", "type": "video"}]))]}),
        );
        h.room.join("room", &"me".into(), "Me").await.unwrap();
        h.wait_for_pulls(1).await;

        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.factory.receive_sets().len(), 1);
        assert_eq!(h.fake_sig.requests_for(METHOD_PULL).len(), 1);
        assert_eq!(h.room.correlation(&"6725".into()).unwrap().len(), 1);
        assert!(h.log.subscribe_failures().is_empty());
    }

    #[tokio::test]
    async fn disconnect_preserves_session_and_tracks() {
        let h = joined_with(json!([publisher("6725", json!([{"id": "p1", "type": "audio"}]))])).await;
        h.wait_for_answers(0, 1).await;
        h.factory.receive_sets()[0].emit_track("0", MediaKind::Audio);
        assert!(eventually(WAIT, || h.media("6725").len() == 1).await);

        h.fake_sig
            .push_notification(NOTIFY_USER_DISCONNECT, json!({"userId": "6725"}));
        assert!(
            eventually(WAIT, || {
                h.room.participant(&"6725".into()).unwrap().state == ConnectivityState::Disconnected
            })
            .await
        );
        let info = h.room.participant(&"6725".into()).unwrap();
        assert!(info.subscribed);
        assert_eq!(info.track_count, 1);
        assert!(!h.factory.receive_sets()[0].is_closed());

        h.fake_sig
            .push_notification(NOTIFY_USER_RECONNECT, json!({"userId": 6725}));
        assert!(
            eventually(WAIT, || {
                h.room.participant(&"6725".into()).unwrap().state == ConnectivityState::Connected
            })
            .await
        );
    }

    #[tokio::test]
    async fn renderer_sees_tracks_appended_after_attach() {
        let h = joined_with(json!([publisher("6725", json!([{"id": "p1", "type": "video"}]))])).await;
        let sink = RecordingSink::new();
        h.room.attach_renderer(&"6725".into(), sink.clone()).unwrap();
        let attached = sink.media_for(&"6725".into()).unwrap();
        assert!(attached.is_empty());

        h.wait_for_answers(0, 1).await;
        h.factory.receive_sets()[0].emit_track("0", MediaKind::Video);
        assert!(eventually(WAIT, || attached.len() == 1).await);

        let replacement = RecordingSink::new();
        h.room
            .attach_renderer(&"6725".into(), replacement.clone())
            .unwrap();
        assert_eq!(sink.detached(), vec![ParticipantId::new("6725")]);
        assert!(replacement.media_for(&"6725".into()).unwrap().same_buffer(&attached));
    }

    #[tokio::test]
    async fn subscribe_validates_participant_and_publications() {
        let h = joined_with(json!([
            {"userId": "quiet", "pushers": []},
            publisher("6725", json!([{"id": "p1", "type": "video"}])),
        ]))
        .await;
        let spec = PullSpec::new(MediaKind::Video, "p1");

        let err = h.room.subscribe(&"ghost".into(), &[spec.clone()]).await.unwrap_err();
        assert!(matches!(err, RoomError::NotFound(_)));
        let err = h.room.subscribe(&"quiet".into(), &[spec]).await.unwrap_err();
        assert!(matches!(err, RoomError::NotFound(_)));
        let err = h
            .room
            .subscribe(&"6725".into(), &[PullSpec::new(MediaKind::Audio, "p1")])
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::NotFound(_)));
    }

    #[tokio::test]
    async fn operations_require_join() {
        let h = harness_with(test_settings());
        assert_eq!(
            h.room
                .open_local_publish(&MediaConstraints::default())
                .await
                .unwrap_err(),
            RoomError::NotJoined
        );
        assert_eq!(h.room.send_chat("hi").await.unwrap_err(), RoomError::NotJoined);
        assert_eq!(
            h.room
                .subscribe(&"6725".into(), &[PullSpec::new(MediaKind::Video, "p1")])
                .await
                .unwrap_err(),
            RoomError::NotJoined
        );
    }

    #[tokio::test]
    async fn open_local_publish_is_idempotent() {
        let h = joined_with(json!([])).await;
        let constraints = MediaConstraints::default();
        let first = h.room.open_local_publish(&constraints).await.unwrap();
        let second = h.room.open_local_publish(&constraints).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(h.factory.send_sets().len(), 1);
        assert_eq!(h.factory.send_sets()[0].open_calls(), 1);
        assert_eq!(h.fake_sig.requests_for(METHOD_PUSH).len(), 1);
        assert!(h.log.any(|e| matches!(e, RoomEvent::LocalPublished)));

        h.room
            .set_local_track_enabled(MediaKind::Video, false)
            .await
            .unwrap();
        let stream = h.room.local_stream().await.unwrap();
        let video = stream.tracks.iter().find(|t| t.kind() == MediaKind::Video).unwrap();
        assert!(!video.is_enabled());
    }

    #[tokio::test]
    async fn denied_devices_fail_publish_without_push() {
        let h = joined_with(json!([])).await;
        h.factory.deny_devices(true);
        let err = h
            .room
            .open_local_publish(&MediaConstraints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::DeviceDenied(_)));
        assert!(h.fake_sig.requests_for(METHOD_PUSH).is_empty());

        h.factory.deny_devices(false);
        h.room
            .open_local_publish(&MediaConstraints::default())
            .await
            .unwrap();
        assert_eq!(h.factory.send_sets().len(), 1);
    }

    #[tokio::test]
    async fn chat_round_trip() {
        let h = joined_with(json!([])).await;
        h.fake_sig.push_notification(
            NOTIFY_TEXT_MESSAGE,
            json!({"userId": "6725", "userName": "Alice", "message": "hello", "time": 5}),
        );
        assert!(eventually(WAIT, || h.log.any(|e| matches!(e, RoomEvent::ChatMessageReceived(_)))).await);

        h.room.send_chat("hi back").await.unwrap();
        let messages = h.room.messages().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].origin, MessageOrigin::Remote);
        assert_eq!(messages[0].sender_id, ParticipantId::new("6725"));
        assert_eq!(messages[1].origin, MessageOrigin::Local);
        assert_eq!(h.fake_sig.notifies()[0].1["message"], "hi back");

        assert!(matches!(
            h.room.send_chat(" ").await,
            Err(RoomError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn unknown_and_malformed_notifications_are_skipped() {
        let h = joined_with(json!([])).await;
        h.fake_sig.push_notification("bogus", json!({}));
        h.fake_sig
            .push_notification(NOTIFY_NEW_PUSHER, json!({"pushers": "nope"}));
        h.fake_sig
            .push_notification(NOTIFY_NEW_USER, json!({"users": [{"userId": "a"}]}));
        assert!(eventually(WAIT, || h.room.participants().len() == 1).await);
    }

    #[tokio::test]
    async fn signaling_loss_keeps_room_state() {
        let h = joined_with(json!([{"userId": "6725", "pushers": []}])).await;
        SignalingChannel::close(&h.fake_sig).await;

        assert!(eventually(WAIT, || h.log.any(|e| matches!(e, RoomEvent::SignalingLost))).await);
        assert_eq!(h.room.connection_state(), ConnectionState::Joined);
        assert_eq!(h.room.participants().len(), 1);
    }

    #[tokio::test]
    async fn heartbeats_are_sent_and_failures_swallowed() {
        let h = harness_with(Settings {
            heartbeat_interval_ms: 20,
            ..test_settings()
        });
        h.fake_sig
            .fail(METHOD_HEARTBEAT, RoomError::Transport("timeout".into()));
        h.room.join("room", &"me".into(), "Me").await.unwrap();

        assert!(eventually(WAIT, || h.fake_sig.requests_for(METHOD_HEARTBEAT).len() >= 3).await);
        let (_, payload) = h.fake_sig.requests_for(METHOD_HEARTBEAT).remove(0);
        assert_eq!(payload["roomId"], "room");
        assert_eq!(payload["userName"], "Me");
        assert_eq!(h.room.connection_state(), ConnectionState::Joined);
    }

    #[tokio::test]
    async fn leave_tears_everything_down() {
        let h = joined_with(json!([publisher("6725", json!([{"id": "p1", "type": "video"}]))])).await;
        h.room
            .open_local_publish(&MediaConstraints::default())
            .await
            .unwrap();
        let sink = RecordingSink::new();
        h.room.attach_renderer(&"6725".into(), sink.clone()).unwrap();
        h.wait_for_answers(0, 1).await;

        let room = h.room.clone();
        let pending = tokio::spawn(async move {
            room.subscribe(&"6725".into(), &[PullSpec::new(MediaKind::Video, "p1")])
                .await
        });
        h.wait_for_pulls(2).await;

        h.room.leave().await;
        assert_eq!(pending.await.unwrap().unwrap_err(), RoomError::Cancelled);
        assert_eq!(h.room.connection_state(), ConnectionState::Disconnected);
        assert!(h.room.participants().is_empty());
        assert!(h.room.messages().await.is_empty());
        assert!(h.factory.sets().iter().all(|s| s.is_closed()));
        assert_eq!(sink.detached(), vec![ParticipantId::new("6725")]);
        assert_eq!(h.fake_sig.close_count(), 1);

        // idempotent
        h.room.leave().await;
        assert_eq!(h.fake_sig.close_count(), 1);
        assert!(!h.fake_sig.push_notification(NOTIFY_NEW_USER, json!([])));
    }
}
