use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use homeward_core::UserKey;
use tokio::{sync::Mutex, time::Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomMembership {
    pub joined_at: Instant,
    pub conversation_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinAttempt {
    Joined,
    AlreadyJoined { conversation_id: Option<Uuid> },
}

#[derive(Default)]
struct Rooms {
    members: HashMap<Uuid, HashSet<UserKey>>,
    entries: HashMap<(Uuid, UserKey), RoomMembership>,
}

impl Rooms {
    fn remove(&mut self, property_id: Uuid, user: &UserKey) -> bool {
        let removed = self.entries.remove(&(property_id, user.clone())).is_some();
        if let Some(set) = self.members.get_mut(&property_id) {
            set.remove(user);
            if set.is_empty() {
                self.members.remove(&property_id);
            }
        }
        removed
    }
}

/// Who is in which property room.
///
/// At most one membership exists per `(property, user)`; entries older than
/// the TTL are dropped by [`RoomTracker::evict_stale`] whether or not the
/// socket ever said goodbye.
#[derive(Clone, Default)]
pub struct RoomTracker {
    rooms: Arc<Mutex<Rooms>>,
}

impl RoomTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn try_join(&self, property_id: Uuid, user: &UserKey) -> JoinAttempt {
        self.try_join_at(property_id, user, Instant::now()).await
    }

    pub async fn try_join_at(&self, property_id: Uuid, user: &UserKey, now: Instant) -> JoinAttempt {
        let mut rooms = self.rooms.lock().await;
        if let Some(existing) = rooms.entries.get(&(property_id, user.clone())) {
            return JoinAttempt::AlreadyJoined {
                conversation_id: existing.conversation_id,
            };
        }
        rooms.entries.insert(
            (property_id, user.clone()),
            RoomMembership {
                joined_at: now,
                conversation_id: None,
            },
        );
        rooms
            .members
            .entry(property_id)
            .or_default()
            .insert(user.clone());
        JoinAttempt::Joined
    }

    pub async fn set_conversation(&self, property_id: Uuid, user: &UserKey, conversation_id: Uuid) {
        if let Some(entry) = self
            .rooms
            .lock()
            .await
            .entries
            .get_mut(&(property_id, user.clone()))
        {
            entry.conversation_id = Some(conversation_id);
        }
    }

    pub async fn leave(&self, property_id: Uuid, user: &UserKey) -> bool {
        self.rooms.lock().await.remove(property_id, user)
    }

    /// Drop every membership held by `user`; returns the properties it left.
    pub async fn remove_user(&self, user: &UserKey) -> Vec<Uuid> {
        let mut rooms = self.rooms.lock().await;
        let properties: Vec<Uuid> = rooms
            .entries
            .keys()
            .filter(|(_, key)| key == user)
            .map(|(property_id, _)| *property_id)
            .collect();
        for property_id in &properties {
            rooms.remove(*property_id, user);
        }
        properties
    }

    pub async fn evict_stale(&self, now: Instant, ttl: Duration) -> Vec<(Uuid, UserKey)> {
        let mut rooms = self.rooms.lock().await;
        let stale: Vec<(Uuid, UserKey)> = rooms
            .entries
            .iter()
            .filter(|(_, membership)| now.saturating_duration_since(membership.joined_at) > ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for (property_id, user) in &stale {
            rooms.remove(*property_id, user);
        }
        stale
    }

    pub async fn membership(&self, property_id: Uuid, user: &UserKey) -> Option<RoomMembership> {
        self.rooms
            .lock()
            .await
            .entries
            .get(&(property_id, user.clone()))
            .copied()
    }

    pub async fn members(&self, property_id: Uuid) -> Vec<UserKey> {
        let mut members: Vec<UserKey> = self
            .rooms
            .lock()
            .await
            .members
            .get(&property_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    pub async fn len(&self) -> usize {
        self.rooms.lock().await.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homeward_core::Role;

    #[tokio::test]
    async fn second_join_is_a_no_op() {
        let rooms = RoomTracker::new();
        let property = Uuid::new_v4();
        let user = UserKey::new("client_tl-1", Role::Client);

        assert_eq!(rooms.try_join(property, &user).await, JoinAttempt::Joined);
        let conversation = Uuid::new_v4();
        rooms.set_conversation(property, &user, conversation).await;

        assert_eq!(
            rooms.try_join(property, &user).await,
            JoinAttempt::AlreadyJoined {
                conversation_id: Some(conversation)
            }
        );
        assert_eq!(rooms.len().await, 1);
        assert_eq!(rooms.members(property).await, vec![user]);
    }

    #[tokio::test]
    async fn stale_entries_are_evicted_without_disconnect() {
        let rooms = RoomTracker::new();
        let ttl = Duration::from_secs(300);
        let start = Instant::now();
        let (old, fresh) = (Uuid::new_v4(), Uuid::new_v4());
        let user = UserKey::new("agent-1", Role::Agent);

        rooms.try_join_at(old, &user, start).await;
        rooms
            .try_join_at(fresh, &user, start + Duration::from_secs(200))
            .await;

        let evicted = rooms
            .evict_stale(start + Duration::from_secs(301), ttl)
            .await;
        assert_eq!(evicted, vec![(old, user.clone())]);
        assert!(rooms.membership(old, &user).await.is_none());
        assert!(rooms.membership(fresh, &user).await.is_some());
        assert!(rooms.members(old).await.is_empty());
    }

    #[tokio::test]
    async fn remove_user_clears_every_room() {
        let rooms = RoomTracker::new();
        let user = UserKey::new("abc", Role::Client);
        let other = UserKey::new("abc", Role::Agent);
        let (p1, p2) = (Uuid::new_v4(), Uuid::new_v4());
        rooms.try_join(p1, &user).await;
        rooms.try_join(p2, &user).await;
        rooms.try_join(p1, &other).await;

        let mut left = rooms.remove_user(&user).await;
        left.sort();
        let mut expected = vec![p1, p2];
        expected.sort();
        assert_eq!(left, expected);
        assert_eq!(rooms.members(p1).await, vec![other]);
        assert!(!rooms.leave(p2, &user).await);
    }
}
