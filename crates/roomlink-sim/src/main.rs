//! Loopback walkthrough of a room session against the in-memory server.
//!
//! `ROOMLINK_DATA_DIR` selects where `settings.json` is read from;
//! `RUST_LOG` overrides the default log filter.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use roomlink_core::protocol::{
    METHOD_JOIN, NOTIFY_NEW_PUSHER, NOTIFY_TEXT_MESSAGE, NOTIFY_USER_LEAVE,
};
use roomlink_core::testing::{FakeCapabilityFactory, FakeSignaling, RecordingSink, eventually};
use roomlink_core::{
    MediaKind, ParticipantId, RoomError, RoomEvent, RoomEventListener, RoomManager, SettingsStore,
};
use serde_json::json;

const DEFAULT_FILTER: &str = "roomlink_core=debug,roomlink_sim=info";
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILTER)),
        )
        .init();
}

struct EventPrinter;

impl RoomEventListener for EventPrinter {
    fn on_event(&self, event: RoomEvent) {
        match event {
            RoomEvent::TrackBound(info) => tracing::info!(
                "track {} ({}) bound to {} of {}",
                info.track_id,
                info.kind,
                info.publication_id,
                info.participant
            ),
            RoomEvent::ChatMessageReceived(msg) => {
                tracing::info!("[chat] {}: {}", msg.sender_name, msg.text)
            }
            RoomEvent::SubscribeFailed { participant, error } => {
                tracing::warn!("subscribe to {participant} failed: {error}")
            }
            other => tracing::debug!("event: {other:?}"),
        }
    }
}

fn data_dir() -> PathBuf {
    std::env::var_os("ROOMLINK_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("roomlink-sim"))
}

async fn step(what: &str, cond: impl FnMut() -> bool) -> Result<(), RoomError> {
    if eventually(STEP_TIMEOUT, cond).await {
        Ok(())
    } else {
        tracing::error!("timed out waiting for {what}");
        Err(RoomError::Timeout)
    }
}

#[tokio::main]
async fn main() -> Result<(), RoomError> {
    init_logging();

    let store = SettingsStore::new(&data_dir().to_string_lossy());
    let settings = store.get();
    settings.validate()?;
    let display_name = settings
        .display_name
        .clone()
        .unwrap_or_else(|| "sim-user".to_string());
    tracing::info!(
        "signaling {} ({:?}, heartbeat {}ms)",
        settings.signaling_url,
        settings.ice_mode,
        settings.heartbeat_interval_ms
    );

    let server = FakeSignaling::new();
    let capabilities = FakeCapabilityFactory::new();
    server.respond(
        METHOD_JOIN,
        json!({"code": 0, "users": [{"userId": "alice", "userName": "Alice", "pushers": []}]}),
    );

    let room = RoomManager::new(
        settings.clone(),
        Arc::new(server.clone()),
        Arc::new(capabilities.clone()),
    );
    room.add_listener(Arc::new(EventPrinter));

    room.join("demo", &ParticipantId::new("sim"), &display_name).await?;
    let local = room.open_local_publish(&settings.media_constraints).await?;
    tracing::info!("publishing capture {} ({} tracks)", local.id, local.tracks.len());

    let alice = ParticipantId::new("alice");
    let sink = RecordingSink::new();
    room.attach_renderer(&alice, sink.clone())?;

    server.push_notification(
        NOTIFY_NEW_PUSHER,
        json!({"userId": "alice", "userName": "Alice", "pushers": [
            {"id": "alice-mic", "type": "audio"},
            {"id": "alice-cam", "type": "video"},
        ]}),
    );
    step("alice's subscription", || {
        capabilities
            .receive_sets()
            .first()
            .is_some_and(|s| !s.answers().is_empty())
    })
    .await?;

    room.set_mute(&alice, MediaKind::Audio, true)?;
    for set in capabilities.receive_sets() {
        set.emit_all_tracks();
    }
    let media = sink
        .media_for(&alice)
        .ok_or_else(|| RoomError::NotFound("renderer media".into()))?;
    step("alice's tracks", || media.len() == 2).await?;
    for track in media.tracks() {
        tracing::info!("rendering {} {} enabled={}", track.kind(), track.id(), track.is_enabled());
    }

    server.push_notification(
        NOTIFY_TEXT_MESSAGE,
        json!({"userId": "alice", "userName": "Alice", "message": "hi there"}),
    );
    room.send_chat("hello alice").await?;
    step("chat log", || server.notifies().len() == 1).await?;

    server.push_notification(NOTIFY_USER_LEAVE, json!({"userId": "alice"}));
    step("alice leaving", || room.participant(&alice).is_none()).await?;

    let messages = room.messages().await;
    tracing::info!("{} chat messages exchanged", messages.len());
    room.leave().await;
    tracing::info!("left room, state {:?}", room.connection_state());
    Ok(())
}
