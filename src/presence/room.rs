//! Rooms
//!
//! A room is a named set of players sharing one broadcast scope.
//! Membership changes take the write lock; fan-out snapshots the
//! member list under the read lock and sends with no lock held, so a
//! slow peer never blocks joins or leaves.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::network::protocol::ServerMessage;
use crate::presence::player::{DeliveryError, Player, PlayerId, PlayerSnapshot};

/// Who may join a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomAccess {
    /// Anyone authenticated.
    Public,
    /// Only the listed emails.
    Private {
        /// Allow-listed emails.
        allowed: HashSet<String>,
    },
}

/// Outcome of the join-authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinDecision {
    /// Join permitted.
    Allow,
    /// Private room, email not on the allow-list.
    Deny,
}

impl JoinDecision {
    /// Is the join permitted.
    pub fn is_allowed(self) -> bool {
        matches!(self, JoinDecision::Allow)
    }
}

/// Decide whether `email` may join a room with the given access rule.
pub fn authorize_join(access: &RoomAccess, email: &str) -> JoinDecision {
    match access {
        RoomAccess::Public => JoinDecision::Allow,
        RoomAccess::Private { allowed } if allowed.contains(email) => JoinDecision::Allow,
        RoomAccess::Private { .. } => JoinDecision::Deny,
    }
}

/// Room errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    /// Room was reaped; resolve it again through the registry.
    #[error("room {0} is closed")]
    Closed(String),
}

/// Result of a fan-out. Delivery is best-effort: every member is tried.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// Members the message was queued for.
    pub delivered: usize,
    /// Members that could not be reached.
    pub failures: Vec<(PlayerId, DeliveryError)>,
}

impl BroadcastReport {
    /// Every attempted send succeeded.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of members a send was attempted for.
    pub fn attempted(&self) -> usize {
        self.delivered + self.failures.len()
    }
}

struct Members {
    players: HashMap<PlayerId, Arc<Player>>,
    /// When the room last became empty.
    idle_since: Option<Instant>,
    /// Set once the registry has dropped this room.
    closed: bool,
}

/// A room.
pub struct Room {
    id: String,
    access: RoomAccess,
    pinned: bool,
    members: RwLock<Members>,
}

impl Room {
    /// Create an empty public room.
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_access(id, RoomAccess::Public, false)
    }

    /// Create an empty room with explicit access. Pinned rooms are never reaped.
    pub fn with_access(id: impl Into<String>, access: RoomAccess, pinned: bool) -> Self {
        Self {
            id: id.into(),
            access,
            pinned,
            members: RwLock::new(Members {
                players: HashMap::new(),
                idle_since: Some(Instant::now()),
                closed: false,
            }),
        }
    }

    /// Create a pinned private room.
    pub fn private<I, S>(id: impl Into<String>, allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let allowed = allowed.into_iter().map(Into::into).collect();
        Self::with_access(id, RoomAccess::Private { allowed }, true)
    }

    /// Room identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Is membership restricted.
    pub fn is_private(&self) -> bool {
        matches!(self.access, RoomAccess::Private { .. })
    }

    /// Join-authorization check for this room.
    pub fn admits(&self, email: &str) -> JoinDecision {
        authorize_join(&self.access, email)
    }

    /// Add a player. Returns `Ok(false)` if the id was already a member,
    /// in which case the entry is refreshed but not duplicated.
    ///
    /// Access control is the caller's job; see [`Room::admits`].
    pub async fn add_member(&self, player: Arc<Player>) -> Result<bool, RoomError> {
        let inserted = {
            let mut members = self.members.write().await;
            if members.closed {
                return Err(RoomError::Closed(self.id.clone()));
            }
            members.idle_since = None;
            members.players.insert(player.id(), player.clone()).is_none()
        };
        player.set_room(Some(self.id.clone())).await;
        debug!(room_id = %self.id, player_id = %player.id(), inserted, "member added");
        Ok(inserted)
    }

    /// Remove a player and tell the remaining members.
    ///
    /// Returns `None` if the id was not a member; nothing is broadcast then.
    pub async fn remove_member(&self, id: PlayerId) -> Option<BroadcastReport> {
        let removed = {
            let mut members = self.members.write().await;
            let removed = members.players.remove(&id);
            if removed.is_some() && members.players.is_empty() {
                members.idle_since = Some(Instant::now());
            }
            removed
        }?;
        removed.set_room(None).await;
        debug!(room_id = %self.id, player_id = %id, "member removed");

        Some(self.broadcast_exclusive(id, ServerMessage::PlayerLeft { id }).await)
    }

    /// Is `id` currently a member.
    pub async fn contains(&self, id: PlayerId) -> bool {
        self.members.read().await.players.contains_key(&id)
    }

    /// Number of members.
    pub async fn member_count(&self) -> usize {
        self.members.read().await.players.len()
    }

    /// Send to every member.
    pub async fn broadcast(&self, msg: ServerMessage) -> BroadcastReport {
        let targets = self.snapshot_members(None).await;
        self.fan_out(targets, msg).await
    }

    /// Send to every member except `sender`.
    pub async fn broadcast_exclusive(&self, sender: PlayerId, msg: ServerMessage) -> BroadcastReport {
        let targets = self.snapshot_members(Some(sender)).await;
        self.fan_out(targets, msg).await
    }

    /// Positions of every current member.
    pub async fn player_positions(&self) -> Vec<PlayerSnapshot> {
        let players = self.snapshot_members(None).await;
        let mut positions = Vec::with_capacity(players.len());
        for player in players {
            positions.push(player.snapshot().await);
        }
        positions
    }

    /// Close the room if it has been empty for at least `ttl`.
    ///
    /// Called by the registry while it holds its own write lock.
    pub(crate) async fn close_if_idle(&self, ttl: Duration, now: Instant) -> bool {
        if self.pinned {
            return false;
        }
        let mut members = self.members.write().await;
        let expired = members.players.is_empty()
            && members.idle_since.is_some_and(|since| now.saturating_duration_since(since) >= ttl);
        if expired {
            members.closed = true;
        }
        expired
    }

    async fn snapshot_members(&self, skip: Option<PlayerId>) -> Vec<Arc<Player>> {
        let members = self.members.read().await;
        members.players.iter()
            .filter(|(id, _)| Some(**id) != skip)
            .map(|(_, p)| p.clone())
            .collect()
    }

    async fn fan_out(&self, targets: Vec<Arc<Player>>, msg: ServerMessage) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for player in targets {
            match player.send(msg.clone()).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(room_id = %self.id, player_id = %player.id(), error = %e, "delivery failed");
                    report.failures.push((player.id(), e));
                }
            }
        }
        report
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("access", &self.access)
            .field("pinned", &self.pinned)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::position::Position;
    use crate::presence::player::{Identity, Outbound};
    use proptest::prelude::*;
    use tokio::sync::mpsc;

    fn player(id: u64) -> (Arc<Player>, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(16);
        let out = Outbound::new(tx, Duration::from_millis(50));
        let identity = Identity::new(format!("p{id}"), format!("p{id}@example.com"));
        (Arc::new(Player::authenticated(PlayerId::new(id), identity, Position::SPAWN, out)), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let room = Room::new("lobby");
        let (p0, _rx) = player(0);

        assert_eq!(room.add_member(p0.clone()).await, Ok(true));
        assert_eq!(room.add_member(p0.clone()).await, Ok(false));
        assert_eq!(room.member_count().await, 1);
        assert_eq!(p0.room().await.as_deref(), Some("lobby"));
    }

    #[tokio::test]
    async fn test_broadcast_includes_sender() {
        let room = Room::new("lobby");
        let (p0, mut rx0) = player(0);
        let (p1, mut rx1) = player(1);
        room.add_member(p0).await.unwrap();
        room.add_member(p1).await.unwrap();

        let report = room.broadcast(ServerMessage::PlayerLeft { id: PlayerId::new(5) }).await;
        assert_eq!(report.delivered, 2);
        assert_eq!(drain(&mut rx0).len(), 1);
        assert_eq!(drain(&mut rx1).len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_exclusive_skips_sender() {
        let room = Room::new("lobby");
        let (p0, mut rx0) = player(0);
        let (p1, mut rx1) = player(1);
        room.add_member(p0).await.unwrap();
        room.add_member(p1).await.unwrap();

        let msg = ServerMessage::RemotePosition { id: PlayerId::new(0), position: Position::new(1.0, 2.0) };
        let report = room.broadcast_exclusive(PlayerId::new(0), msg.clone()).await;

        assert_eq!(report.attempted(), 1);
        assert!(drain(&mut rx0).is_empty());
        assert_eq!(drain(&mut rx1), vec![msg]);
    }

    #[tokio::test]
    async fn test_broadcast_continues_past_dead_member() {
        let room = Room::new("lobby");
        let (p0, rx0) = player(0);
        let (p1, mut rx1) = player(1);
        let (p2, mut rx2) = player(2);
        drop(rx0);
        room.add_member(p0).await.unwrap();
        room.add_member(p1).await.unwrap();
        room.add_member(p2).await.unwrap();

        let report = room.broadcast(ServerMessage::PlayerLeft { id: PlayerId::new(9) }).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(report.failures, vec![(PlayerId::new(0), DeliveryError::Closed)]);
        assert_eq!(drain(&mut rx1).len(), 1);
        assert_eq!(drain(&mut rx2).len(), 1);
    }

    #[tokio::test]
    async fn test_remove_notifies_remaining_members_once() {
        let room = Room::new("lobby");
        let (p0, mut rx0) = player(0);
        let (p1, mut rx1) = player(1);
        room.add_member(p0).await.unwrap();
        room.add_member(p1.clone()).await.unwrap();

        let report = room.remove_member(PlayerId::new(1)).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(drain(&mut rx0), vec![ServerMessage::PlayerLeft { id: PlayerId::new(1) }]);
        assert!(drain(&mut rx1).is_empty());
        assert_eq!(p1.room().await, None);

        // Second removal is a no-op.
        assert!(room.remove_member(PlayerId::new(1)).await.is_none());
        assert!(drain(&mut rx0).is_empty());
    }

    #[tokio::test]
    async fn test_player_positions_snapshot() {
        let room = Room::new("lobby");
        let (p0, _rx0) = player(0);
        let (p1, _rx1) = player(1);
        p1.set_position(Position::new(3.0, 4.0)).await;
        room.add_member(p0).await.unwrap();
        room.add_member(p1).await.unwrap();

        let mut positions = room.player_positions().await;
        positions.sort_by_key(|p| p.id);
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[1].position, Position::new(3.0, 4.0));
        assert_eq!(positions[1].name, "p1");
    }

    #[test]
    fn test_private_room_admission() {
        let room = Room::private("board", ["ceo@example.com"]);
        assert!(room.is_private());
        assert_eq!(room.admits("ceo@example.com"), JoinDecision::Allow);
        assert_eq!(room.admits("intern@example.com"), JoinDecision::Deny);

        let open = Room::new("lobby");
        assert!(open.admits("anyone@example.com").is_allowed());
    }

    #[tokio::test]
    async fn test_close_if_idle() {
        let room = Room::new("lobby");
        let (p0, _rx) = player(0);
        room.add_member(p0).await.unwrap();

        let later = Instant::now() + Duration::from_secs(600);
        assert!(!room.close_if_idle(Duration::from_secs(1), later).await);

        room.remove_member(PlayerId::new(0)).await;
        let later = Instant::now() + Duration::from_secs(600);
        assert!(room.close_if_idle(Duration::from_secs(1), later).await);

        let (p1, _rx1) = player(1);
        assert_eq!(room.add_member(p1).await, Err(RoomError::Closed("lobby".into())));
    }

    #[tokio::test]
    async fn test_pinned_room_never_closes() {
        let room = Room::private("board", ["a@example.com"]);
        let later = Instant::now() + Duration::from_secs(3600);
        assert!(!room.close_if_idle(Duration::ZERO, later).await);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(u64),
        Remove(u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..8).prop_map(Op::Add),
            (0u64..8).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn prop_membership_tracks_adds_and_removes(ops in proptest::collection::vec(op(), 0..64)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let room = Room::new("prop");
                let mut expected = HashSet::new();
                let mut receivers = Vec::new();

                for op in ops {
                    match op {
                        Op::Add(id) => {
                            let (p, rx) = player(id);
                            receivers.push(rx);
                            room.add_member(p).await.unwrap();
                            expected.insert(id);
                        }
                        Op::Remove(id) => {
                            let was_member = room.remove_member(PlayerId::new(id)).await.is_some();
                            assert_eq!(was_member, expected.remove(&id));
                            assert!(!room.contains(PlayerId::new(id)).await);
                        }
                    }
                    // Drain so bounded queues never fill up.
                    for rx in receivers.iter_mut() {
                        while rx.try_recv().is_ok() {}
                    }
                    assert_eq!(room.member_count().await, expected.len());
                }
            });
        }
    }
}
