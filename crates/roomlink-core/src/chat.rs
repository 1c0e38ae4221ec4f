use std::sync::Arc;
use tokio::sync::Mutex;

use crate::errors::RoomError;
use crate::events::{ChatMessage, EventEmitter, MessageOrigin, RoomEvent};
use crate::protocol::{InboundText, OutboundText};
use crate::room::JoinedRoom;
use crate::signaling::SignalingClient;

/// Shared message store between the notification reducer and ChatService.
pub type MessageStore = Arc<Mutex<Vec<ChatMessage>>>;

/// Room chat carried over `textMessage` notifies.
#[derive(Clone)]
pub struct ChatService {
    emitter: EventEmitter,
    messages: MessageStore,
}

impl ChatService {
    pub fn new(emitter: EventEmitter, messages: MessageStore) -> Self {
        Self { emitter, messages }
    }

    /// Broadcast `text` to the room and record it locally.
    pub async fn send_message(
        &self,
        signaling: &SignalingClient,
        room: &JoinedRoom,
        text: &str,
    ) -> Result<ChatMessage, RoomError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RoomError::InvalidInput("chat message is empty".into()));
        }

        let time = chrono::Utc::now().timestamp_millis();
        signaling
            .send_text(&OutboundText {
                room_id: room.room_id.clone(),
                user_id: room.user_id.clone(),
                user_name: room.user_name.clone(),
                message: text.to_string(),
                time,
            })
            .await?;

        let msg = ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: room.user_id.clone(),
            sender_name: room.user_name.clone(),
            text: text.to_string(),
            origin: MessageOrigin::Local,
            timestamp_ms: time,
        };

        self.messages.lock().await.push(msg.clone());
        self.emitter.emit(RoomEvent::ChatMessageReceived(msg.clone()));

        Ok(msg)
    }

    /// Get all messages in the current session.
    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.messages.lock().await.clone()
    }

    /// Handle an incoming chat message from the notification reducer.
    pub async fn handle_incoming(&self, text: InboundText) -> ChatMessage {
        let msg = ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: text.user_id,
            sender_name: text.user_name,
            text: text.message,
            origin: MessageOrigin::Remote,
            timestamp_ms: text
                .time
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
        };
        self.messages.lock().await.push(msg.clone());
        self.emitter.emit(RoomEvent::ChatMessageReceived(msg.clone()));
        msg
    }

    /// Clear all messages (on leave).
    pub async fn clear(&self) {
        self.messages.lock().await.clear();
    }
}
