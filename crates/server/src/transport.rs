use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use homeward_core::{EventFrame, Role};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    RwLock,
};
use uuid::Uuid;

pub type Outbound = Arc<EventFrame>;

/// Name of a broadcast group: `agent_<id>`, `client_<id>`, `timeline_<id>`
/// or `property_<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey(String);

impl GroupKey {
    pub fn user(role: Role, user_id: &str) -> Self {
        Self(format!("{role}_{user_id}"))
    }

    pub fn agent(agent_id: Uuid) -> Self {
        Self::user(Role::Agent, &agent_id.to_string())
    }

    pub fn client(client_id: Uuid) -> Self {
        Self::user(Role::Client, &client_id.to_string())
    }

    pub fn timeline(timeline_id: &str) -> Self {
        Self(format!("timeline_{timeline_id}"))
    }

    pub fn property(property_id: Uuid) -> Self {
        Self(format!("property_{property_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Default)]
struct HubState {
    connections: HashMap<Uuid, mpsc::Sender<Outbound>>,
    groups: HashMap<GroupKey, HashSet<Uuid>>,
}

/// Fan-out of outbound frames to live connections and named groups.
///
/// Each connection gets a bounded queue; a full queue drops the frame for
/// that connection only.
#[derive(Clone)]
pub struct Hub {
    state: Arc<RwLock<HubState>>,
    buffer: usize,
}

impl Hub {
    pub fn new(buffer: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(HubState::default())),
            buffer: buffer.max(1),
        }
    }

    pub async fn register(&self, connection_id: Uuid) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.state.write().await.connections.insert(connection_id, tx);
        rx
    }

    pub async fn unregister(&self, connection_id: Uuid) {
        let mut state = self.state.write().await;
        state.connections.remove(&connection_id);
        state.groups.retain(|_, members| {
            members.remove(&connection_id);
            !members.is_empty()
        });
    }

    pub async fn join_group(&self, connection_id: Uuid, group: &GroupKey) {
        self.state
            .write()
            .await
            .groups
            .entry(group.clone())
            .or_default()
            .insert(connection_id);
    }

    pub async fn leave_group(&self, connection_id: Uuid, group: &GroupKey) {
        let mut state = self.state.write().await;
        if let Some(members) = state.groups.get_mut(group) {
            members.remove(&connection_id);
            if members.is_empty() {
                state.groups.remove(group);
            }
        }
    }

    pub async fn emit_to(&self, connection_id: Uuid, frame: Outbound) -> bool {
        let state = self.state.read().await;
        match state.connections.get(&connection_id) {
            Some(tx) => deliver(connection_id, tx, frame),
            None => false,
        }
    }

    /// Deliver to every member of `group`; returns how many queues accepted it.
    pub async fn emit_to_group(&self, group: &GroupKey, frame: Outbound) -> usize {
        self.fan_out(group, None, frame).await
    }

    pub async fn emit_to_group_except(
        &self,
        group: &GroupKey,
        except: Uuid,
        frame: Outbound,
    ) -> usize {
        self.fan_out(group, Some(except), frame).await
    }

    /// Deliver once to every connection in any of `groups`.
    pub async fn emit_to_groups(&self, groups: &[GroupKey], frame: Outbound) -> usize {
        self.fan_out_union(groups, None, frame).await
    }

    pub async fn emit_to_groups_except(
        &self,
        groups: &[GroupKey],
        except: Uuid,
        frame: Outbound,
    ) -> usize {
        self.fan_out_union(groups, Some(except), frame).await
    }

    pub async fn group_size(&self, group: &GroupKey) -> usize {
        self.state
            .read()
            .await
            .groups
            .get(group)
            .map_or(0, HashSet::len)
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    async fn fan_out_union(
        &self,
        groups: &[GroupKey],
        except: Option<Uuid>,
        frame: Outbound,
    ) -> usize {
        let state = self.state.read().await;
        let targets: HashSet<Uuid> = groups
            .iter()
            .filter_map(|group| state.groups.get(group))
            .flatten()
            .copied()
            .filter(|id| Some(*id) != except)
            .collect();
        targets
            .iter()
            .filter_map(|id| state.connections.get(id).map(|tx| (id, tx)))
            .filter(|(id, tx)| deliver(**id, tx, frame.clone()))
            .count()
    }

    async fn fan_out(&self, group: &GroupKey, except: Option<Uuid>, frame: Outbound) -> usize {
        let state = self.state.read().await;
        let Some(members) = state.groups.get(group) else {
            return 0;
        };
        members
            .iter()
            .filter(|id| Some(**id) != except)
            .filter_map(|id| state.connections.get(id).map(|tx| (id, tx)))
            .filter(|(id, tx)| deliver(**id, tx, frame.clone()))
            .count()
    }
}

fn deliver(connection_id: Uuid, tx: &mpsc::Sender<Outbound>, frame: Outbound) -> bool {
    match tx.try_send(frame) {
        Ok(()) => true,
        Err(TrySendError::Full(frame)) => {
            tracing::warn!(
                %connection_id,
                event = %frame.event,
                "outbound queue full; dropping frame"
            );
            false
        }
        Err(TrySendError::Closed(_)) => {
            tracing::debug!(%connection_id, "outbound queue closed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homeward_core::{event::Pong, EventName};

    fn pong(timestamp: i64) -> Outbound {
        Arc::new(EventFrame::new(EventName::Pong, &Pong { timestamp }).unwrap())
    }

    #[tokio::test]
    async fn group_emit_skips_excluded_connection() {
        let hub = Hub::new(8);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut rx_a = hub.register(a).await;
        let mut rx_b = hub.register(b).await;
        let room = GroupKey::property(Uuid::nil());
        hub.join_group(a, &room).await;
        hub.join_group(b, &room).await;

        assert_eq!(hub.emit_to_group_except(&room, a, pong(1)).await, 1);
        assert_eq!(rx_b.recv().await.unwrap().data["timestamp"], 1);
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn overlapping_groups_deliver_once() {
        let hub = Hub::new(8);
        let id = Uuid::new_v4();
        let mut rx = hub.register(id).await;
        let (client, timeline) = (GroupKey::client(Uuid::nil()), GroupKey::timeline("t"));
        hub.join_group(id, &client).await;
        hub.join_group(id, &timeline).await;

        assert_eq!(hub.emit_to_groups(&[client, timeline], pong(3)).await, 1);
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let hub = Hub::new(1);
        let id = Uuid::new_v4();
        let mut rx = hub.register(id).await;

        assert!(hub.emit_to(id, pong(1)).await);
        assert!(!hub.emit_to(id, pong(2)).await);
        assert_eq!(rx.recv().await.unwrap().data["timestamp"], 1);
    }

    #[tokio::test]
    async fn unregister_prunes_empty_groups() {
        let hub = Hub::new(4);
        let id = Uuid::new_v4();
        let _rx = hub.register(id).await;
        let group = GroupKey::agent(Uuid::nil());
        hub.join_group(id, &group).await;
        assert_eq!(hub.group_size(&group).await, 1);

        hub.unregister(id).await;
        assert_eq!(hub.group_size(&group).await, 0);
        assert_eq!(hub.connection_count().await, 0);
    }

    #[test]
    fn group_keys_match_channel_names() {
        assert_eq!(
            GroupKey::agent(Uuid::nil()).as_str(),
            "agent_00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(GroupKey::timeline("abc").as_str(), "timeline_abc");
    }
}
