//! Room Registry
//!
//! Process-wide map from room id to room plus the player id allocator.
//! Constructed once at startup and shared by `Arc`; there is no global.
//!
//! Lock ordering: the registry lock is always taken before any room lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::info;

use crate::presence::player::PlayerId;
use crate::presence::room::Room;

/// Registry of rooms.
pub struct Registry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    next_player_id: AtomicU64,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            next_player_id: AtomicU64::new(0),
        }
    }

    /// Look up a room.
    pub async fn get_room(&self, id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(id).cloned()
    }

    /// Create a public room, replacing any room already stored under `id`.
    pub async fn create_room(&self, id: &str) -> Arc<Room> {
        self.insert(Room::new(id)).await
    }

    /// Create a pinned private room, replacing any room under the same id.
    pub async fn create_private_room<I, S>(&self, id: &str, allowed: I) -> Arc<Room>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.insert(Room::private(id, allowed)).await
    }

    /// Look up a room, creating a public one if absent.
    pub async fn get_or_create_room(&self, id: &str) -> Arc<Room> {
        if let Some(room) = self.get_room(id).await {
            return room;
        }
        let mut rooms = self.rooms.write().await;
        rooms.entry(id.to_string())
            .or_insert_with(|| {
                info!(room_id = %id, "room created");
                Arc::new(Room::new(id))
            })
            .clone()
    }

    /// Allocate the next player id. Strictly increasing, never reused.
    pub fn next_player_id(&self) -> PlayerId {
        PlayerId::new(self.next_player_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Number of ids handed out so far.
    pub fn allocated_ids(&self) -> u64 {
        self.next_player_id.load(Ordering::SeqCst)
    }

    /// Number of rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Drop unpinned rooms that have been empty for at least `ttl`.
    /// Returns the ids of the rooms removed.
    pub async fn reap_idle_rooms(&self, ttl: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut rooms = self.rooms.write().await;
        let mut reaped = Vec::new();

        for (id, room) in rooms.iter() {
            if room.close_if_idle(ttl, now).await {
                reaped.push(id.clone());
            }
        }
        for id in &reaped {
            rooms.remove(id);
        }

        if !reaped.is_empty() {
            info!(count = reaped.len(), "reaped idle rooms");
        }
        reaped
    }

    async fn insert(&self, room: Room) -> Arc<Room> {
        let room = Arc::new(room);
        self.rooms.write().await.insert(room.id().to_string(), room.clone());
        room
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_get_missing_room() {
        let registry = Registry::new();
        assert!(registry.get_room("nowhere").await.is_none());
    }

    #[tokio::test]
    async fn test_get_or_create_is_stable() {
        let registry = Registry::new();
        let a = registry.get_or_create_room("lobby").await;
        let b = registry.get_or_create_room("lobby").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_create_room_overwrites() {
        let registry = Registry::new();
        let first = registry.create_room("lobby").await;
        let second = registry.create_room("lobby").await;
        assert!(!Arc::ptr_eq(&first, &second));
        let current = registry.get_room("lobby").await.unwrap();
        assert!(Arc::ptr_eq(&current, &second));
    }

    #[tokio::test]
    async fn test_private_room_registration() {
        let registry = Registry::new();
        registry.create_private_room("board", ["ceo@example.com"]).await;
        let room = registry.get_room("board").await.unwrap();
        assert!(room.is_private());
    }

    #[test]
    fn test_player_ids_increase() {
        let registry = Registry::new();
        assert_eq!(registry.next_player_id(), PlayerId::new(0));
        assert_eq!(registry.next_player_id(), PlayerId::new(1));
        assert_eq!(registry.allocated_ids(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_id_allocation_unique() {
        let registry = Arc::new(Registry::new());
        let mut handles = Vec::new();
        for _ in 0..64 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                (0..16).map(|_| registry.next_player_id()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            let ids = handle.await.unwrap();
            // Each task sees its own ids in increasing order.
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            for id in ids {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 64 * 16);
        assert_eq!(registry.allocated_ids(), 64 * 16);
    }

    #[tokio::test]
    async fn test_reap_skips_pinned_and_fresh_rooms() {
        let registry = Registry::new();
        registry.get_or_create_room("stale").await;
        registry.create_private_room("board", ["a@example.com"]).await;

        assert!(registry.reap_idle_rooms(Duration::from_secs(3600)).await.is_empty());

        let reaped = registry.reap_idle_rooms(Duration::ZERO).await;
        assert_eq!(reaped, vec!["stale".to_string()]);
        assert!(registry.get_room("stale").await.is_none());
        assert!(registry.get_room("board").await.is_some());
    }
}
