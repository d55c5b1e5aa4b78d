//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every frame is one JSON object tagged by `messageType`.
//! Inbound frames carry their payload under `data`; outbound frames
//! inline their fields next to the tag.

use serde::{Serialize, Deserialize};

use crate::core::position::Position;
use crate::presence::player::{PlayerId, PlayerSnapshot};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Authenticate with a bearer JWT.
    Auth(AuthPayload),

    /// Join a room.
    Room(RoomPayload),

    /// Position update, relayed to the rest of the room.
    Position(PositionPayload),

    /// Initial placement, stored but not relayed.
    PositionInit(PositionInitPayload),

    /// Chat line, relayed to the whole room.
    Chat(ChatPayload),
}

impl ClientMessage {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Auth(_) => "auth",
            ClientMessage::Room(_) => "room",
            ClientMessage::Position(_) => "position",
            ClientMessage::PositionInit(_) => "position-init",
            ClientMessage::Chat(_) => "chat",
        }
    }
}

/// Authentication request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    /// Bearer token issued by the identity provider.
    pub jwt: String,
}

/// Room join request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPayload {
    /// Target room.
    pub room_id: String,
}

/// Position update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionPayload {
    /// Client's idea of its own id. Ignored: the server uses the session's id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// New position.
    pub position: Position,
}

/// Initial placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionInitPayload {
    /// Starting position.
    pub position: Position,
}

/// Chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    /// Text.
    pub message: String,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Authentication acknowledgment.
    Auth {
        /// Always true; failures are reported with `error`.
        authenticated: bool,
    },

    /// Assigns the new player's id.
    Id {
        /// Player identifier.
        id: PlayerId,
    },

    /// Full position snapshot of the joined room.
    Players {
        /// One entry per member, joining player included.
        players: Vec<PlayerSnapshot>,
    },

    /// Someone joined the room.
    AddPlayer {
        /// Joining player.
        id: PlayerId,
        /// Their position.
        position: Position,
    },

    /// Someone moved.
    RemotePosition {
        /// Moving player.
        id: PlayerId,
        /// New position.
        position: Position,
    },

    /// Someone left the room.
    PlayerLeft {
        /// Departed player.
        id: PlayerId,
    },

    /// Chat line.
    Chat {
        /// Sender.
        id: PlayerId,
        /// Line with sender details.
        message: ChatLine,
    },

    /// Error.
    Error {
        /// Human-readable reason.
        error: String,
    },
}

/// Chat line as delivered to room members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatLine {
    /// Sender id.
    pub id: PlayerId,
    /// Sender display name.
    pub name: String,
    /// Text.
    pub message: String,
}

impl ServerMessage {
    /// Build an error frame.
    pub fn error(reason: impl Into<String>) -> Self {
        ServerMessage::Error { error: reason.into() }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Auth { .. } => "auth",
            ServerMessage::Id { .. } => "id",
            ServerMessage::Players { .. } => "players",
            ServerMessage::AddPlayer { .. } => "add-player",
            ServerMessage::RemotePosition { .. } => "remote-position",
            ServerMessage::PlayerLeft { .. } => "player-left",
            ServerMessage::Chat { .. } => "chat",
            ServerMessage::Error { .. } => "error",
        }
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Deserialize from JSON bytes (binary WebSocket frames).
    pub fn from_slice(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
