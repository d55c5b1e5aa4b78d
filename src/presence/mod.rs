//! Presence Layer
//!
//! In-memory state shared by every connection: players, rooms and the
//! registry that owns them.
//!
//! ## Module Structure
//!
//! - `player`: per-connection state and the authenticated send gate
//! - `room`: membership and best-effort fan-out
//! - `registry`: room lookup/creation, id allocation, idle reaping

pub mod player;
pub mod room;
pub mod registry;

pub use player::{DeliveryError, Identity, Outbound, Player, PlayerId, PlayerSnapshot};
pub use room::{authorize_join, BroadcastReport, JoinDecision, Room, RoomAccess, RoomError};
pub use registry::Registry;
