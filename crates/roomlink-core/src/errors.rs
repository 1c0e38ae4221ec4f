use thiserror::Error;

use crate::capability::CapabilityError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    #[error("signaling transport failed: {0}")]
    Transport(String),
    #[error("server rejected request (code {code}): {message}")]
    ServerRejected { code: i64, message: String },
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("capture device denied: {0}")]
    DeviceDenied(String),
    #[error("timed out waiting for inbound tracks")]
    Timeout,
    #[error("operation cancelled")]
    Cancelled,
    #[error("not joined to a room")]
    NotJoined,
    #[error("already joined to a room")]
    AlreadyJoined,
    #[error("a join is already in flight")]
    JoinInFlight,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("settings error: {0}")]
    Settings(String),
}

impl From<CapabilityError> for RoomError {
    fn from(e: CapabilityError) -> Self {
        match e {
            CapabilityError::DeviceDenied(msg) => RoomError::DeviceDenied(msg),
            CapabilityError::Failed(msg) => RoomError::Negotiation(msg),
        }
    }
}

impl From<serde_json::Error> for RoomError {
    fn from(e: serde_json::Error) -> Self {
        RoomError::Protocol(e.to_string())
    }
}
