//! # Metaverse Office Server
//!
//! Real-time presence for a virtual office: authenticated players join
//! rooms, see each other move and chat.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  METAVERSE OFFICE SERVER                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Value types                               │
//! │  └── position.rs - 2D position on the office map             │
//! │                                                              │
//! │  presence/       - Shared in-memory state                    │
//! │  ├── player.rs   - Player, outbound queue, send gate         │
//! │  ├── room.rs     - Membership and fan-out                    │
//! │  └── registry.rs - Rooms by id, player id allocation         │
//! │                                                              │
//! │  network/        - Transport                                 │
//! │  ├── server.rs   - WebSocket listener and connection tasks   │
//! │  ├── session.rs  - Per-connection state machine              │
//! │  ├── protocol.rs - JSON message types                        │
//! │  ├── auth.rs     - JWT verification                          │
//! │  └── http.rs     - Room pre-flight validation                │
//! │                                                              │
//! │  config.rs       - Environment configuration                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery
//!
//! Room broadcasts are best-effort: a member whose queue is closed or
//! stalled is reported and skipped, the rest still receive the message.
//! Locks are never held while sending.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod network;
pub mod presence;

// Re-export commonly used types
pub use config::ServerConfig;
pub use core::position::Position;
pub use presence::{Player, PlayerId, Registry, Room};
pub use network::{ClientMessage, PresenceServer, ServerMessage};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
