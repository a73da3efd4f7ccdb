//! Room & peer registry.
//!
//! A single actor owns every [`Room`](room::Room). Signaling handlers call it
//! through [`RegistryActorHandle`].

pub mod actor;
pub mod messages;
pub mod room;

pub use actor::{RegistryActorHandle, RegistrySettings};
pub use messages::{ConnectionId, PeerSnapshot, RequestContext, RoomSnapshot};
