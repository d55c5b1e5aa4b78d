//! Player State
//!
//! Server-side state for one connection: identity, position, the
//! authentication flag and the outbound send capability.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use serde::{Serialize, Deserialize};
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::sync::mpsc::error::SendTimeoutError;

use crate::core::position::Position;
use crate::network::protocol::ServerMessage;

/// Reason substituted for any message addressed to an unauthenticated player.
pub const NOT_AUTHENTICATED: &str = "player not authenticated";

// =============================================================================
// PLAYER ID
// =============================================================================

/// Process-unique player identifier handed out by the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub u64);

impl PlayerId {
    /// Placeholder id carried by guests. The registry counts up from zero
    /// and never reaches it.
    pub const GUEST: Self = Self(u64::MAX);

    /// Create from a raw value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw value.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Is this the guest placeholder.
    pub const fn is_guest(self) -> bool {
        self.0 == u64::MAX
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_guest() {
            f.write_str("guest")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

// =============================================================================
// IDENTITY
// =============================================================================

/// Verified identity attached to an authenticated player.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    /// Display name shown to other players.
    pub name: String,
    /// Verified email, used for private room allow-lists.
    pub email: String,
}

impl Identity {
    /// Create an identity.
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self { name: name.into(), email: email.into() }
    }
}

// =============================================================================
// OUTBOUND
// =============================================================================

/// Why a message did not reach a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// Player has not authenticated; an error frame was sent instead.
    #[error("player not authenticated")]
    NotAuthenticated,

    /// The connection's writer is gone.
    #[error("connection closed")]
    Closed,

    /// The peer's queue stayed full past the send timeout.
    #[error("send timed out")]
    TimedOut,
}

/// Exclusive per-connection channel for outbound frames.
///
/// Owned by the connection task; players hold a clone.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<ServerMessage>,
    timeout: Duration,
    kick: Arc<Notify>,
}

impl Outbound {
    /// Wrap a channel sender.
    pub fn new(tx: mpsc::Sender<ServerMessage>, timeout: Duration) -> Self {
        Self { tx, timeout, kick: Arc::new(Notify::new()) }
    }

    /// Enqueue a frame, waiting at most the configured timeout.
    ///
    /// A timeout kicks the connection: a peer that cannot keep up is
    /// treated as disconnected.
    pub async fn deliver(&self, msg: ServerMessage) -> Result<(), DeliveryError> {
        match self.tx.send_timeout(msg, self.timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Closed(_)) => Err(DeliveryError::Closed),
            Err(SendTimeoutError::Timeout(_)) => {
                self.kick.notify_one();
                Err(DeliveryError::TimedOut)
            }
        }
    }

    /// Signal fired when this connection must be dropped.
    pub fn kick_signal(&self) -> Arc<Notify> {
        self.kick.clone()
    }
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbound")
            .field("timeout", &self.timeout)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

// =============================================================================
// PLAYER
// =============================================================================

/// A connected player.
#[derive(Debug)]
pub struct Player {
    id: PlayerId,
    identity: Identity,
    authenticated: bool,
    position: RwLock<Position>,
    room: RwLock<Option<String>>,
    outbound: Outbound,
}

/// One entry of a room's position snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    /// Player identifier.
    pub id: PlayerId,
    /// Display name.
    pub name: String,
    /// Last reported position.
    pub position: Position,
}

impl Player {
    /// Create an authenticated player.
    pub fn authenticated(
        id: PlayerId,
        identity: Identity,
        position: Position,
        outbound: Outbound,
    ) -> Self {
        Self {
            id,
            identity,
            authenticated: true,
            position: RwLock::new(position),
            room: RwLock::new(None),
            outbound,
        }
    }

    /// Create the placeholder for a connection that has not authenticated.
    pub fn guest(outbound: Outbound) -> Self {
        Self {
            id: PlayerId::GUEST,
            identity: Identity::default(),
            authenticated: false,
            position: RwLock::new(Position::SPAWN),
            room: RwLock::new(None),
            outbound,
        }
    }

    /// Player identifier.
    pub fn id(&self) -> PlayerId {
        self.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    /// Verified email.
    pub fn email(&self) -> &str {
        &self.identity.email
    }

    /// Current position.
    pub async fn position(&self) -> Position {
        *self.position.read().await
    }

    /// Move the player.
    pub async fn set_position(&self, position: Position) {
        *self.position.write().await = position;
    }

    /// Room the player was last added to.
    pub async fn room(&self) -> Option<String> {
        self.room.read().await.clone()
    }

    pub(crate) async fn set_room(&self, room: Option<String>) {
        *self.room.write().await = room;
    }

    /// Snapshot for a `players` frame.
    pub async fn snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot {
            id: self.id,
            name: self.identity.name.clone(),
            position: self.position().await,
        }
    }

    /// Send a message to this player.
    ///
    /// Unauthenticated players never see the payload: they get the
    /// `player not authenticated` error frame and the caller gets
    /// [`DeliveryError::NotAuthenticated`].
    pub async fn send(&self, msg: ServerMessage) -> Result<(), DeliveryError> {
        if !self.authenticated {
            self.outbound.deliver(ServerMessage::error(NOT_AUTHENTICATED)).await?;
            return Err(DeliveryError::NotAuthenticated);
        }
        self.outbound.deliver(msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound(capacity: usize) -> (Outbound, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Outbound::new(tx, Duration::from_millis(50)), rx)
    }

    #[test]
    fn test_guest_id_display() {
        assert_eq!(PlayerId::GUEST.to_string(), "guest");
        assert_eq!(PlayerId::new(7).to_string(), "7");
        assert!(!PlayerId::new(0).is_guest());
    }

    #[tokio::test]
    async fn test_authenticated_send_delivers_payload() {
        let (out, mut rx) = outbound(4);
        let player = Player::authenticated(
            PlayerId::new(1),
            Identity::new("Ada", "ada@example.com"),
            Position::SPAWN,
            out,
        );

        player.send(ServerMessage::PlayerLeft { id: PlayerId::new(9) }).await.unwrap();
        assert_eq!(rx.recv().await, Some(ServerMessage::PlayerLeft { id: PlayerId::new(9) }));
    }

    #[tokio::test]
    async fn test_unauthenticated_send_substitutes_error() {
        let (out, mut rx) = outbound(4);
        let guest = Player::guest(out);

        let result = guest.send(ServerMessage::Id { id: PlayerId::new(3) }).await;
        assert_eq!(result, Err(DeliveryError::NotAuthenticated));
        assert_eq!(rx.recv().await, Some(ServerMessage::error(NOT_AUTHENTICATED)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_closed_connection() {
        let (out, rx) = outbound(4);
        drop(rx);
        let player = Player::authenticated(PlayerId::new(1), Identity::default(), Position::SPAWN, out);

        let result = player.send(ServerMessage::PlayerLeft { id: PlayerId::new(2) }).await;
        assert_eq!(result, Err(DeliveryError::Closed));
    }

    #[tokio::test]
    async fn test_full_queue_times_out_and_kicks() {
        let (out, _rx) = outbound(1);
        let kick = out.kick_signal();
        let player = Player::authenticated(PlayerId::new(1), Identity::default(), Position::SPAWN, out);

        player.send(ServerMessage::PlayerLeft { id: PlayerId::new(2) }).await.unwrap();
        let result = player.send(ServerMessage::PlayerLeft { id: PlayerId::new(3) }).await;
        assert_eq!(result, Err(DeliveryError::TimedOut));

        // The permit is stored, so a later wait completes immediately.
        tokio::time::timeout(Duration::from_millis(100), kick.notified())
            .await
            .expect("kick should have been signalled");
    }

    #[tokio::test]
    async fn test_position_and_room_reference() {
        let (out, _rx) = outbound(1);
        let player = Player::authenticated(PlayerId::new(4), Identity::new("Bo", "bo@x.io"), Position::SPAWN, out);

        player.set_position(Position::new(1.0, 2.0)).await;
        player.set_room(Some("lobby".into())).await;

        let snap = player.snapshot().await;
        assert_eq!(snap.position, Position::new(1.0, 2.0));
        assert_eq!(snap.name, "Bo");
        assert_eq!(player.room().await.as_deref(), Some("lobby"));
    }
}
