//! Connection Session
//!
//! Per-connection state machine. A session starts unauthenticated, becomes
//! roomless once its token checks out, and is in a room after a successful
//! `room` message. Every inbound message goes through one transition
//! function; messages that do not fit the current state are answered with
//! an `error` frame and leave the state untouched.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::position::Position;
use crate::network::auth::IdentityVerifier;
use crate::network::protocol::{ChatLine, ClientMessage, ServerMessage};
use crate::presence::player::{Outbound, Player, PlayerId};
use crate::presence::registry::Registry;
use crate::presence::room::{BroadcastReport, Room, RoomError};

/// Sent for malformed frames.
pub const MALFORMED_MESSAGE: &str = "malformed message";
/// Sent for position/chat before joining a room.
pub const NOT_IN_ROOM: &str = "player is not in a room";
/// Sent for a second `auth`.
pub const ALREADY_AUTHENTICATED: &str = "already authenticated";
/// Sent when a private room's allow-list rejects the player.
pub const ROOM_FORBIDDEN: &str = "not allowed to join room";

/// Attempts to re-resolve a room that was reaped mid-join.
const JOIN_ATTEMPTS: usize = 3;

/// Session phase, as observed from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for a valid `auth`.
    Unauthenticated,
    /// Authenticated, not in a room.
    Roomless,
    /// Authenticated and in a room.
    InRoom,
    /// Connection finished.
    Closed,
}

/// What the connection loop should do after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Read the next frame.
    Continue,
    /// Close the connection.
    Close,
}

/// Per-session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Failed `auth` messages tolerated before closing.
    pub max_auth_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { max_auth_attempts: 3 }
    }
}

enum ConnectionState {
    Unauthenticated {
        guest: Arc<Player>,
        failed_auth: u32,
    },
    Roomless {
        player: Arc<Player>,
    },
    InRoom {
        player: Arc<Player>,
        room: Arc<Room>,
    },
    Closed,
}

/// One connection's session.
pub struct Session {
    state: ConnectionState,
    registry: Arc<Registry>,
    verifier: Arc<dyn IdentityVerifier>,
    outbound: Outbound,
    config: SessionConfig,
}

impl Session {
    /// Create a session for a freshly upgraded connection.
    pub fn new(
        registry: Arc<Registry>,
        verifier: Arc<dyn IdentityVerifier>,
        outbound: Outbound,
        config: SessionConfig,
    ) -> Self {
        let guest = Arc::new(Player::guest(outbound.clone()));
        Self {
            state: ConnectionState::Unauthenticated { guest, failed_auth: 0 },
            registry,
            verifier,
            outbound,
            config,
        }
    }

    /// Current phase.
    pub fn state(&self) -> SessionState {
        match self.state {
            ConnectionState::Unauthenticated { .. } => SessionState::Unauthenticated,
            ConnectionState::Roomless { .. } => SessionState::Roomless,
            ConnectionState::InRoom { .. } => SessionState::InRoom,
            ConnectionState::Closed => SessionState::Closed,
        }
    }

    /// Authenticated player, if any.
    pub fn player(&self) -> Option<&Arc<Player>> {
        match &self.state {
            ConnectionState::Roomless { player } | ConnectionState::InRoom { player, .. } => Some(player),
            _ => None,
        }
    }

    /// Id of the joined room, if any.
    pub fn room_id(&self) -> Option<&str> {
        match &self.state {
            ConnectionState::InRoom { room, .. } => Some(room.id()),
            _ => None,
        }
    }

    /// Decode and handle a text frame. Malformed frames are skipped.
    pub async fn handle_text(&mut self, text: &str) -> Flow {
        #[cfg(feature = "debug-tracing")]
        tracing::trace!(frame = %text, "inbound frame");

        match ClientMessage::from_json(text) {
            Ok(msg) => self.handle(msg).await,
            Err(e) => self.malformed(e).await,
        }
    }

    /// Decode and handle a binary frame carrying JSON.
    pub async fn handle_binary(&mut self, data: &[u8]) -> Flow {
        match ClientMessage::from_slice(data) {
            Ok(msg) => self.handle(msg).await,
            Err(e) => self.malformed(e).await,
        }
    }

    /// Handle one decoded message.
    pub async fn handle(&mut self, msg: ClientMessage) -> Flow {
        debug!(kind = msg.kind(), state = ?self.state(), "handling message");
        let state = std::mem::replace(&mut self.state, ConnectionState::Closed);
        let (next, flow) = match state {
            ConnectionState::Unauthenticated { guest, failed_auth } => {
                self.on_unauthenticated(guest, failed_auth, msg).await
            }
            ConnectionState::Roomless { player } => self.on_roomless(player, msg).await,
            ConnectionState::InRoom { player, room } => self.on_in_room(player, room, msg).await,
            ConnectionState::Closed => (ConnectionState::Closed, Flow::Close),
        };
        self.state = next;
        flow
    }

    /// Leave any joined room and move to `Closed`. Safe to call twice.
    pub async fn close(&mut self) {
        let state = std::mem::replace(&mut self.state, ConnectionState::Closed);
        if let ConnectionState::InRoom { player, room } = state {
            if let Some(report) = room.remove_member(player.id()).await {
                log_report(&room, "player-left", &report);
            }
            info!(player_id = %player.id(), room_id = %room.id(), "player left");
        }
    }

    async fn on_unauthenticated(
        &self,
        guest: Arc<Player>,
        failed_auth: u32,
        msg: ClientMessage,
    ) -> (ConnectionState, Flow) {
        match msg {
            ClientMessage::Auth(auth) => match self.verifier.verify(&auth.jwt) {
                Ok(identity) => {
                    let id = self.registry.next_player_id();
                    let position = guest.position().await;
                    let player = Arc::new(Player::authenticated(id, identity, position, self.outbound.clone()));

                    // The ack is the one application frame written outside the gate.
                    if let Err(e) = self.outbound.deliver(ServerMessage::Auth { authenticated: true }).await {
                        debug!(player_id = %id, error = %e, "failed to send auth ack");
                    }
                    if let Err(e) = player.send(ServerMessage::Id { id }).await {
                        debug!(player_id = %id, error = %e, "failed to send id");
                    }

                    info!(player_id = %id, name = %player.name(), "player authenticated");
                    (ConnectionState::Roomless { player }, Flow::Continue)
                }
                Err(e) => {
                    let failed_auth = failed_auth + 1;
                    warn!(error = %e, attempt = failed_auth, "authentication failed");
                    self.reply_error(format!("authentication failed: {e}")).await;

                    let flow = if failed_auth >= self.config.max_auth_attempts {
                        Flow::Close
                    } else {
                        Flow::Continue
                    };
                    (ConnectionState::Unauthenticated { guest, failed_auth }, flow)
                }
            },
            ClientMessage::PositionInit(init) => {
                if init.position.is_finite() {
                    guest.set_position(init.position).await;
                } else {
                    self.reply_error(MALFORMED_MESSAGE).await;
                }
                (ConnectionState::Unauthenticated { guest, failed_auth }, Flow::Continue)
            }
            other => {
                debug!(kind = other.kind(), "rejected before authentication");
                // Guests are behind the send gate: this reaches the client as
                // the not-authenticated error frame.
                let _ = guest.send(ServerMessage::error(other.kind())).await;
                (ConnectionState::Unauthenticated { guest, failed_auth }, Flow::Continue)
            }
        }
    }

    async fn on_roomless(&self, player: Arc<Player>, msg: ClientMessage) -> (ConnectionState, Flow) {
        match msg {
            ClientMessage::Room(req) => self.join(player, None, req.room_id).await,
            ClientMessage::PositionInit(init) => {
                self.move_player(&player, init.position).await;
                (ConnectionState::Roomless { player }, Flow::Continue)
            }
            ClientMessage::Auth(_) => {
                self.reply_error(ALREADY_AUTHENTICATED).await;
                (ConnectionState::Roomless { player }, Flow::Continue)
            }
            ClientMessage::Position(_) | ClientMessage::Chat(_) => {
                self.reply_error(NOT_IN_ROOM).await;
                (ConnectionState::Roomless { player }, Flow::Continue)
            }
        }
    }

    async fn on_in_room(
        &self,
        player: Arc<Player>,
        room: Arc<Room>,
        msg: ClientMessage,
    ) -> (ConnectionState, Flow) {
        match msg {
            ClientMessage::Room(req) => return self.join(player, Some(room), req.room_id).await,
            ClientMessage::Position(update) => {
                if self.move_player(&player, update.position).await {
                    let report = room.broadcast_exclusive(player.id(), ServerMessage::RemotePosition {
                        id: player.id(),
                        position: update.position,
                    }).await;
                    log_report(&room, "remote-position", &report);
                }
            }
            ClientMessage::PositionInit(init) => {
                self.move_player(&player, init.position).await;
            }
            ClientMessage::Chat(chat) => {
                let report = room.broadcast(ServerMessage::Chat {
                    id: player.id(),
                    message: ChatLine {
                        id: player.id(),
                        name: player.name().to_string(),
                        message: chat.message,
                    },
                }).await;
                log_report(&room, "chat", &report);
            }
            ClientMessage::Auth(_) => self.reply_error(ALREADY_AUTHENTICATED).await,
        }
        (ConnectionState::InRoom { player, room }, Flow::Continue)
    }

    /// Join `room_id`, leaving `current` first if it is a different room.
    async fn join(
        &self,
        player: Arc<Player>,
        current: Option<Arc<Room>>,
        room_id: String,
    ) -> (ConnectionState, Flow) {
        let stay = |player: Arc<Player>, current: Option<Arc<Room>>| match current {
            Some(room) => (ConnectionState::InRoom { player, room }, Flow::Continue),
            None => (ConnectionState::Roomless { player }, Flow::Continue),
        };

        let room_id = room_id.trim().to_string();
        if room_id.is_empty() {
            self.reply_error("invalid room id").await;
            return stay(player, current);
        }

        if let Some(room) = &current {
            if room.id() == room_id && room.contains(player.id()).await {
                debug!(player_id = %player.id(), room_id = %room_id, "already in room");
                return stay(player, current);
            }
        }

        let mut left_previous = false;
        for _ in 0..JOIN_ATTEMPTS {
            let room = self.registry.get_or_create_room(&room_id).await;

            if !room.admits(player.email()).is_allowed() {
                warn!(player_id = %player.id(), room_id = %room_id, "join denied by allow-list");
                self.reply_error(ROOM_FORBIDDEN).await;
                let current = if left_previous { None } else { current };
                return stay(player, current);
            }

            if !left_previous {
                if let Some(previous) = &current {
                    if let Some(report) = previous.remove_member(player.id()).await {
                        log_report(previous, "player-left", &report);
                    }
                    info!(player_id = %player.id(), from = %previous.id(), to = %room_id, "switching rooms");
                }
                left_previous = true;
            }

            match room.add_member(player.clone()).await {
                Ok(_) => {
                    self.announce_join(&player, &room).await;
                    return (ConnectionState::InRoom { player, room }, Flow::Continue);
                }
                Err(RoomError::Closed(_)) => {
                    debug!(room_id = %room_id, "room reaped during join, retrying");
                }
            }
        }

        self.reply_error("room unavailable").await;
        (ConnectionState::Roomless { player }, Flow::Continue)
    }

    async fn announce_join(&self, player: &Arc<Player>, room: &Room) {
        info!(player_id = %player.id(), room_id = %room.id(), "player joined room");

        let players = room.player_positions().await;
        if let Err(e) = player.send(ServerMessage::Players { players }).await {
            debug!(player_id = %player.id(), error = %e, "failed to send room snapshot");
        }

        let report = room.broadcast_exclusive(player.id(), ServerMessage::AddPlayer {
            id: player.id(),
            position: player.position().await,
        }).await;
        log_report(room, "add-player", &report);
    }

    /// Store a new position. Non-finite coordinates are refused.
    async fn move_player(&self, player: &Player, position: Position) -> bool {
        if !position.is_finite() {
            self.reply_error(MALFORMED_MESSAGE).await;
            return false;
        }
        player.set_position(position).await;
        true
    }

    async fn malformed(&self, err: serde_json::Error) -> Flow {
        debug!(error = %err, "malformed message skipped");
        self.reply_error(MALFORMED_MESSAGE).await;
        Flow::Continue
    }

    async fn reply_error(&self, reason: impl Into<String>) {
        if let Err(e) = self.outbound.deliver(ServerMessage::error(reason)).await {
            debug!(error = %e, "failed to send error frame");
        }
    }
}

fn log_report(room: &Room, kind: &str, report: &BroadcastReport) {
    if !report.is_complete() {
        let failed: Vec<PlayerId> = report.failures.iter().map(|(id, _)| *id).collect();
        warn!(room_id = %room.id(), kind, delivered = report.delivered, ?failed, "partial broadcast");
    }
}
