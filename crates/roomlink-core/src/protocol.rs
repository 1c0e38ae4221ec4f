//! JSON payloads exchanged over the signaling channel.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::RoomError;
use crate::identity::ParticipantId;
use crate::media::MediaKind;
use crate::signaling::RawNotification;

pub const METHOD_JOIN: &str = "join";
pub const METHOD_PUSH: &str = "push";
pub const METHOD_PULL: &str = "pull";
pub const METHOD_HEARTBEAT: &str = "heartbeat";

pub const NOTIFY_NEW_USER: &str = "newUser";
pub const NOTIFY_NEW_PUSHER: &str = "newPusher";
pub const NOTIFY_USER_DISCONNECT: &str = "userDisconnect";
pub const NOTIFY_USER_RECONNECT: &str = "userReconnect";
pub const NOTIFY_USER_LEAVE: &str = "userLeave";
pub const NOTIFY_TEXT_MESSAGE: &str = "textMessage";

/// A track a participant made available to the room.
///
/// Everything besides `id` and `type` is the codec/RTP bundle, kept as-is and
/// forwarded verbatim.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Publication {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MediaKind,
    #[serde(flatten)]
    pub parameters: Map<String, Value>,
}

impl Publication {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
            parameters: Map::new(),
        }
    }

    pub fn spec(&self) -> PullSpec {
        PullSpec {
            kind: self.kind,
            publication_id: self.id.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub user_id: ParticipantId,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub pushers: Vec<Publication>,
}

/// One publication to receive, as sent in a `pull`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PullSpec {
    #[serde(rename = "type")]
    pub kind: MediaKind,
    #[serde(rename = "pusher_id")]
    pub publication_id: String,
}

impl PullSpec {
    pub fn new(kind: MediaKind, publication_id: impl Into<String>) -> Self {
        Self {
            kind,
            publication_id: publication_id.into(),
        }
    }
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub room_id: String,
    pub user_id: ParticipantId,
    pub user_name: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct JoinResponse {
    pub code: i64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub users: Vec<UserInfo>,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub sdp: String,
    pub room_id: String,
    pub user_id: ParticipantId,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub sdp: String,
    pub room_id: String,
    pub user_id: ParticipantId,
    pub target_user_id: ParticipantId,
    pub specs: Vec<PullSpec>,
}

/// Response to `push` and `pull`.
#[derive(Deserialize, Debug, Clone)]
pub struct SdpResponse {
    pub code: i64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub sdp: Option<String>,
}

impl SdpResponse {
    /// The answer SDP, or the server's rejection.
    pub fn into_answer(self) -> Result<String, RoomError> {
        if self.code != 0 {
            return Err(RoomError::ServerRejected {
                code: self.code,
                message: self.message.unwrap_or_default(),
            });
        }
        self.sdp
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RoomError::Protocol("response carries no answer sdp".into()))
    }
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub room_id: String,
    pub user_id: ParticipantId,
    pub user_name: String,
    pub time: i64,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OutboundText {
    pub room_id: String,
    pub user_id: ParticipantId,
    pub user_name: String,
    pub message: String,
    pub time: i64,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InboundText {
    pub user_id: ParticipantId,
    #[serde(default)]
    pub user_name: String,
    pub message: String,
    #[serde(default)]
    pub time: Option<i64>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct UserRef {
    user_id: ParticipantId,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UserList {
    Bare(Vec<UserInfo>),
    Wrapped { users: Vec<UserInfo> },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SingleUser {
    Wrapped { user: UserInfo },
    Bare(UserInfo),
}

/// Decoded inbound notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    NewUser(Vec<UserInfo>),
    NewPusher(UserInfo),
    UserDisconnect(ParticipantId),
    UserReconnect(ParticipantId),
    UserLeave(ParticipantId),
    TextMessage(InboundText),
}

impl Notification {
    /// Decode a raw notification. Unknown methods yield `Ok(None)`.
    pub fn parse(raw: &RawNotification) -> Result<Option<Self>, RoomError> {
        let data = raw.data.clone();
        let parsed = match raw.method.as_str() {
            NOTIFY_NEW_USER => match serde_json::from_value::<UserList>(data)? {
                UserList::Bare(users) | UserList::Wrapped { users } => Notification::NewUser(users),
            },
            NOTIFY_NEW_PUSHER => match serde_json::from_value::<SingleUser>(data)? {
                SingleUser::Wrapped { user } | SingleUser::Bare(user) => {
                    Notification::NewPusher(user)
                }
            },
            NOTIFY_USER_DISCONNECT => {
                Notification::UserDisconnect(serde_json::from_value::<UserRef>(data)?.user_id)
            }
            NOTIFY_USER_RECONNECT => {
                Notification::UserReconnect(serde_json::from_value::<UserRef>(data)?.user_id)
            }
            NOTIFY_USER_LEAVE => {
                Notification::UserLeave(serde_json::from_value::<UserRef>(data)?.user_id)
            }
            NOTIFY_TEXT_MESSAGE => Notification::TextMessage(serde_json::from_value(data)?),
            _ => return Ok(None),
        };
        Ok(Some(parsed))
    }
}
