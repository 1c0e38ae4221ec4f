//! Roomlink core: push/pull media room negotiation and membership.
//!
//! Pure Rust crate with no platform dependencies. The signaling transport,
//! the peer-connection primitive and rendering are consumed through traits.

pub mod capability;
pub mod chat;
pub mod errors;
pub mod events;
pub mod identity;
pub mod media;
pub mod participants;
pub mod protocol;
pub mod publish;
pub mod room;
pub mod settings;
pub mod signaling;
pub mod subscription;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use capability::{CapabilityFactory, CapabilitySet, IceMode, IceServer};
pub use errors::RoomError;
pub use events::{RoomEvent, RoomEventListener};
pub use identity::ParticipantId;
pub use media::{InboundMedia, MediaConstraints, MediaKind, RenderSink};
pub use protocol::PullSpec;
pub use room::{JoinedRoom, RoomManager};
pub use settings::{Settings, SettingsStore};
pub use signaling::SignalingChannel;
