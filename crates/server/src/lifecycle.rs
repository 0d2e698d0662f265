use std::{collections::HashMap, sync::Arc, time::Duration};

use homeward_core::{Identity, Role, UserKey};
use thiserror::Error;
use tokio::{sync::Mutex, time::Instant};
use uuid::Uuid;

use crate::{identity::ResolvedIdentity, transport::GroupKey};

const MAX_USER_ID_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Ready,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Ready => "ready",
            ConnectionState::Closed => "closed",
        }
    }

    fn can_advance_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticated)
                | (Authenticated, Ready)
                | (Connecting, Closed)
                | (Authenticated, Closed)
                | (Ready, Closed)
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("connection cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub from: &'static str,
    pub to: &'static str,
}

/// A live socket after identity resolution.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: Uuid,
    pub identity: Identity,
    pub role: Role,
    pub timeline_id: Option<String>,
    state: ConnectionState,
}

impl Connection {
    /// Move a freshly resolved socket into `Authenticated`.
    ///
    /// An identity whose user id is empty or unusable is replaced with an
    /// emergency identity scoped to this connection.
    pub fn authenticate(id: Uuid, resolved: ResolvedIdentity, timeline_id: Option<String>) -> Self {
        let identity = if usable_user_id(resolved.identity.user_id()) {
            resolved.identity
        } else {
            tracing::error!(
                connection_id = %id,
                kind = resolved.identity.kind(),
                "identity resolution produced an unusable user id; substituting emergency identity"
            );
            Identity::emergency(id)
        };

        Self {
            id,
            identity,
            role: resolved.role,
            timeline_id: timeline_id.filter(|t| !t.trim().is_empty()),
            state: ConnectionState::Authenticated,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn advance(&mut self, next: ConnectionState) -> Result<(), InvalidTransition> {
        if !self.state.can_advance_to(next) {
            return Err(InvalidTransition {
                from: self.state.as_str(),
                to: next.as_str(),
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn user_id(&self) -> &str {
        self.identity.user_id()
    }

    pub fn user_key(&self) -> UserKey {
        UserKey::new(self.identity.user_id(), self.role)
    }

    /// Personal broadcast groups this connection belongs to for its lifetime.
    pub fn personal_groups(&self) -> Vec<GroupKey> {
        let mut groups = vec![GroupKey::user(self.role, self.identity.user_id())];
        if let Some(timeline_id) = &self.timeline_id {
            groups.push(GroupKey::timeline(timeline_id));
        }
        groups
    }
}

fn usable_user_id(user_id: &str) -> bool {
    !user_id.trim().is_empty()
        && user_id.len() <= MAX_USER_ID_LEN
        && !user_id.chars().any(char::is_control)
}

/// Last ping seen per connection. Advisory only; never closes sockets.
#[derive(Clone, Default)]
pub struct PingTracker {
    last_seen: Arc<Mutex<HashMap<Uuid, Instant>>>,
}

impl PingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, connection_id: Uuid, at: Instant) {
        self.last_seen.lock().await.insert(connection_id, at);
    }

    pub async fn remove(&self, connection_id: Uuid) {
        self.last_seen.lock().await.remove(&connection_id);
    }

    pub async fn last_seen(&self, connection_id: Uuid) -> Option<Instant> {
        self.last_seen.lock().await.get(&connection_id).copied()
    }

    pub async fn evict_older_than(&self, now: Instant, ttl: Duration) -> usize {
        let mut last_seen = self.last_seen.lock().await;
        let before = last_seen.len();
        last_seen.retain(|_, at| now.saturating_duration_since(*at) <= ttl);
        before - last_seen.len()
    }

    pub async fn len(&self) -> usize {
        self.last_seen.lock().await.len()
    }
}
