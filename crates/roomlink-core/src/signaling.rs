use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::errors::RoomError;
use crate::identity::ParticipantId;
use crate::protocol::{
    HeartbeatRequest, JoinRequest, JoinResponse, METHOD_HEARTBEAT, METHOD_JOIN, METHOD_PULL,
    METHOD_PUSH, NOTIFY_TEXT_MESSAGE, OutboundText, PullRequest, PullSpec, PushRequest,
    SdpResponse,
};

/// Server-initiated message as delivered by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct RawNotification {
    pub method: String,
    pub data: Value,
}

/// Request/notify transport to the signaling server.
///
/// Delivery, reconnection and framing belong to the implementation. All
/// failures are reported as [`RoomError::Transport`].
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Open the channel and hand back the inbound notification stream.
    async fn open(&self) -> Result<mpsc::UnboundedReceiver<RawNotification>, RoomError>;

    async fn request(&self, method: &str, payload: Value) -> Result<Value, RoomError>;

    async fn notify(&self, method: &str, payload: Value) -> Result<(), RoomError>;

    async fn close(&self);
}

/// Typed wrapper over a [`SignalingChannel`].
#[derive(Clone)]
pub struct SignalingClient {
    channel: Arc<dyn SignalingChannel>,
}

impl SignalingClient {
    pub fn new(channel: Arc<dyn SignalingChannel>) -> Self {
        Self { channel }
    }

    pub async fn open(&self) -> Result<mpsc::UnboundedReceiver<RawNotification>, RoomError> {
        self.channel.open().await
    }

    pub async fn close(&self) {
        self.channel.close().await;
    }

    async fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        method: &str,
        req: &Req,
    ) -> Result<Resp, RoomError> {
        let payload = serde_json::to_value(req)?;
        let value = self.channel.request(method, payload).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn join(
        &self,
        room_id: &str,
        user_id: &ParticipantId,
        user_name: &str,
    ) -> Result<JoinResponse, RoomError> {
        let req = JoinRequest {
            room_id: room_id.to_string(),
            user_id: user_id.clone(),
            user_name: user_name.to_string(),
        };
        let resp: JoinResponse = self.call(METHOD_JOIN, &req).await?;
        if resp.code != 0 {
            return Err(RoomError::ServerRejected {
                code: resp.code,
                message: resp.message.unwrap_or_default(),
            });
        }
        Ok(resp)
    }

    /// Send the publish offer, returning the answer SDP.
    pub async fn push(
        &self,
        room_id: &str,
        user_id: &ParticipantId,
        sdp: String,
    ) -> Result<String, RoomError> {
        let req = PushRequest {
            sdp,
            room_id: room_id.to_string(),
            user_id: user_id.clone(),
        };
        let resp: SdpResponse = self.call(METHOD_PUSH, &req).await?;
        resp.into_answer()
    }

    /// Send a subscription offer for `target`, returning the answer SDP.
    pub async fn pull(
        &self,
        room_id: &str,
        user_id: &ParticipantId,
        target: &ParticipantId,
        specs: Vec<PullSpec>,
        sdp: String,
    ) -> Result<String, RoomError> {
        let req = PullRequest {
            sdp,
            room_id: room_id.to_string(),
            user_id: user_id.clone(),
            target_user_id: target.clone(),
            specs,
        };
        let resp: SdpResponse = self.call(METHOD_PULL, &req).await?;
        resp.into_answer()
    }

    /// The response body is ignored.
    pub async fn heartbeat(
        &self,
        room_id: &str,
        user_id: &ParticipantId,
        user_name: &str,
    ) -> Result<(), RoomError> {
        let req = HeartbeatRequest {
            room_id: room_id.to_string(),
            user_id: user_id.clone(),
            user_name: user_name.to_string(),
            time: chrono::Utc::now().timestamp_millis(),
        };
        let payload = serde_json::to_value(&req)?;
        self.channel.request(METHOD_HEARTBEAT, payload).await?;
        Ok(())
    }

    pub async fn send_text(&self, text: &OutboundText) -> Result<(), RoomError> {
        let payload = serde_json::to_value(text)?;
        self.channel.notify(NOTIFY_TEXT_MESSAGE, payload).await
    }
}
