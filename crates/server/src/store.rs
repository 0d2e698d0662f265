use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use async_trait::async_trait;
use chrono::Utc;
use homeward_core::{
    AgentUnreadTree, ClientUnreadCounts, Conversation, Message, PropertyUnreadCounts, Role,
};
use homeward_storage::{
    DirectoryRepository, MessagingRepository, NewConversation, NewMessage, PropertyContext,
    StoragePool, TimelineClient,
};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Durable state the gateway reads and writes.
#[async_trait]
pub trait GatewayStore: Send + Sync {
    async fn find_conversation_by_property(
        &self,
        property_id: Uuid,
    ) -> Result<Option<Conversation>, StoreError>;
    async fn find_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<Conversation>, StoreError>;
    /// Create-if-absent keyed on the property; always returns the stored row.
    async fn create_conversation(
        &self,
        fields: NewConversation,
    ) -> Result<Conversation, StoreError>;
    async fn find_property_context(
        &self,
        property_id: Uuid,
    ) -> Result<Option<PropertyContext>, StoreError>;
    async fn find_timeline_client(
        &self,
        timeline_id: Uuid,
    ) -> Result<Option<TimelineClient>, StoreError>;
    async fn any_active_agent(&self) -> Result<Option<Uuid>, StoreError>;
    async fn append_message(&self, fields: NewMessage) -> Result<Message, StoreError>;
    async fn conversation_messages(
        &self,
        conversation_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError>;
    async fn mark_read(
        &self,
        conversation_id: Uuid,
        reader: Role,
        message_ids: Option<Vec<Uuid>>,
    ) -> Result<Vec<Uuid>, StoreError>;
    async fn property_unread_counts(
        &self,
        conversation_id: Uuid,
    ) -> Result<PropertyUnreadCounts, StoreError>;
    async fn agent_unread_tree(&self, agent_id: Uuid) -> Result<AgentUnreadTree, StoreError>;
    async fn client_unread_counts(&self, client_id: Uuid)
        -> Result<ClientUnreadCounts, StoreError>;
}

pub struct PostgresStore {
    directory: DirectoryRepository,
    messaging: MessagingRepository,
}

impl PostgresStore {
    pub fn new(pool: StoragePool) -> Self {
        Self {
            directory: DirectoryRepository::new(pool.clone()),
            messaging: MessagingRepository::new(pool),
        }
    }
}

#[async_trait]
impl GatewayStore for PostgresStore {
    async fn find_conversation_by_property(
        &self,
        property_id: Uuid,
    ) -> Result<Option<Conversation>, StoreError> {
        Ok(self
            .messaging
            .find_conversation_by_property(property_id)
            .await?)
    }

    async fn find_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<Conversation>, StoreError> {
        Ok(self.messaging.find_conversation(conversation_id).await?)
    }

    async fn create_conversation(
        &self,
        fields: NewConversation,
    ) -> Result<Conversation, StoreError> {
        Ok(self.messaging.create_conversation(&fields).await?)
    }

    async fn find_property_context(
        &self,
        property_id: Uuid,
    ) -> Result<Option<PropertyContext>, StoreError> {
        Ok(self.directory.property_context(property_id).await?)
    }

    async fn find_timeline_client(
        &self,
        timeline_id: Uuid,
    ) -> Result<Option<TimelineClient>, StoreError> {
        Ok(self.directory.timeline_client(timeline_id).await?)
    }

    async fn any_active_agent(&self) -> Result<Option<Uuid>, StoreError> {
        Ok(self.directory.any_active_agent().await?)
    }

    async fn append_message(&self, fields: NewMessage) -> Result<Message, StoreError> {
        Ok(self.messaging.append_message(&fields).await?)
    }

    async fn conversation_messages(
        &self,
        conversation_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .messaging
            .conversation_messages(conversation_id, limit)
            .await?)
    }

    async fn mark_read(
        &self,
        conversation_id: Uuid,
        reader: Role,
        message_ids: Option<Vec<Uuid>>,
    ) -> Result<Vec<Uuid>, StoreError> {
        Ok(self
            .messaging
            .mark_read(conversation_id, reader, message_ids.as_deref())
            .await?)
    }

    async fn property_unread_counts(
        &self,
        conversation_id: Uuid,
    ) -> Result<PropertyUnreadCounts, StoreError> {
        Ok(self.messaging.property_unread_counts(conversation_id).await?)
    }

    async fn agent_unread_tree(&self, agent_id: Uuid) -> Result<AgentUnreadTree, StoreError> {
        Ok(self.messaging.agent_unread_tree(agent_id).await?)
    }

    async fn client_unread_counts(
        &self,
        client_id: Uuid,
    ) -> Result<ClientUnreadCounts, StoreError> {
        Ok(self.messaging.client_unread_counts(client_id).await?)
    }
}

struct AgentRecord {
    active: bool,
    seq: u64,
}

struct TimelineRecord {
    agent_id: Option<Uuid>,
    client_id: Option<Uuid>,
}

/// Process-local store used when no database is configured and in tests.
#[derive(Default)]
pub struct InMemoryStore {
    agents: RwLock<HashMap<Uuid, AgentRecord>>,
    clients: RwLock<HashMap<Uuid, Option<Uuid>>>,
    timelines: RwLock<HashMap<Uuid, TimelineRecord>>,
    properties: RwLock<HashMap<Uuid, Option<Uuid>>>,
    conversations: RwLock<HashMap<Uuid, Conversation>>,
    messages: RwLock<HashMap<Uuid, Vec<Message>>>,
    failing: Mutex<HashSet<&'static str>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_agent(&self, active: bool) -> Uuid {
        let id = Uuid::new_v4();
        let mut agents = self.agents.write().await;
        let seq = agents.len() as u64;
        agents.insert(id, AgentRecord { active, seq });
        id
    }

    pub async fn insert_client(&self, agent_id: Option<Uuid>) -> Uuid {
        let id = Uuid::new_v4();
        self.clients.write().await.insert(id, agent_id);
        id
    }

    pub async fn insert_timeline(&self, agent_id: Option<Uuid>, client_id: Option<Uuid>) -> Uuid {
        let id = Uuid::new_v4();
        self.timelines
            .write()
            .await
            .insert(id, TimelineRecord { agent_id, client_id });
        id
    }

    pub async fn insert_property(&self, timeline_id: Option<Uuid>) -> Uuid {
        let id = Uuid::new_v4();
        self.properties.write().await.insert(id, timeline_id);
        id
    }

    /// Append a raw copy of `message` to the log, bypassing id dedup.
    ///
    /// Mimics an upstream store that replays rows under retry.
    pub async fn replay_message(&self, message: Message) {
        self.messages
            .write()
            .await
            .entry(message.conversation_id)
            .or_default()
            .push(message);
    }

    /// Make the named operation fail until cleared.
    pub fn fail_operation(&self, operation: &'static str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(operation);
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.clear();
        }
    }

    fn check(&self, operation: &'static str) -> Result<(), StoreError> {
        let failing = self
            .failing
            .lock()
            .map(|set| set.contains(operation))
            .unwrap_or(false);
        if failing {
            return Err(StoreError::Storage(anyhow::anyhow!(
                "injected failure in {operation}"
            )));
        }
        Ok(())
    }

    async fn conversation_unread(&self, conversation_id: Uuid, reader: Role) -> u64 {
        self.messages
            .read()
            .await
            .get(&conversation_id)
            .map(|log| {
                let mut seen = HashSet::new();
                log.iter()
                    .filter(|m| seen.insert(m.id) && m.is_unread_for(reader))
                    .count() as u64
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl GatewayStore for InMemoryStore {
    async fn find_conversation_by_property(
        &self,
        property_id: Uuid,
    ) -> Result<Option<Conversation>, StoreError> {
        self.check("find_conversation_by_property")?;
        Ok(self
            .conversations
            .read()
            .await
            .values()
            .find(|c| c.property_id == property_id)
            .cloned())
    }

    async fn find_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<Conversation>, StoreError> {
        self.check("find_conversation")?;
        Ok(self.conversations.read().await.get(&conversation_id).cloned())
    }

    async fn create_conversation(
        &self,
        fields: NewConversation,
    ) -> Result<Conversation, StoreError> {
        self.check("create_conversation")?;
        let mut conversations = self.conversations.write().await;
        if let Some(existing) = conversations
            .values()
            .find(|c| c.property_id == fields.property_id)
        {
            return Ok(existing.clone());
        }
        let conversation = Conversation {
            id: Uuid::new_v4(),
            property_id: fields.property_id,
            timeline_id: fields.timeline_id,
            agent_id: fields.agent_id,
            client_id: fields.client_id,
            created_at: Utc::now(),
        };
        conversations.insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn find_property_context(
        &self,
        property_id: Uuid,
    ) -> Result<Option<PropertyContext>, StoreError> {
        self.check("find_property_context")?;
        let Some(timeline_id) = self.properties.read().await.get(&property_id).copied() else {
            return Ok(None);
        };
        let timelines = self.timelines.read().await;
        let timeline = timeline_id.and_then(|id| timelines.get(&id).map(|t| (id, t)));
        let clients = self.clients.read().await;
        let client_id = timeline.and_then(|(_, t)| t.client_id);

        Ok(Some(PropertyContext {
            property_id,
            timeline_id: timeline.map(|(id, _)| id),
            timeline_agent_id: timeline.and_then(|(_, t)| t.agent_id),
            client_id,
            client_agent_id: client_id.and_then(|id| clients.get(&id).copied().flatten()),
        }))
    }

    async fn find_timeline_client(
        &self,
        timeline_id: Uuid,
    ) -> Result<Option<TimelineClient>, StoreError> {
        self.check("find_timeline_client")?;
        let timelines = self.timelines.read().await;
        let Some(timeline) = timelines.get(&timeline_id) else {
            return Ok(None);
        };
        let Some(client_id) = timeline.client_id else {
            return Ok(None);
        };
        let client_agent = self.clients.read().await.get(&client_id).copied();
        Ok(client_agent.map(|agent| TimelineClient {
            timeline_id,
            client_id,
            agent_id: agent.or(timeline.agent_id),
        }))
    }

    async fn any_active_agent(&self) -> Result<Option<Uuid>, StoreError> {
        self.check("any_active_agent")?;
        Ok(self
            .agents
            .read()
            .await
            .iter()
            .filter(|(_, record)| record.active)
            .min_by_key(|(_, record)| record.seq)
            .map(|(id, _)| *id))
    }

    async fn append_message(&self, fields: NewMessage) -> Result<Message, StoreError> {
        self.check("append_message")?;
        let mut messages = self.messages.write().await;
        let log = messages.entry(fields.conversation_id).or_default();
        if let Some(existing) = log.iter().find(|m| m.id == fields.message_id) {
            return Ok(existing.clone());
        }
        let message = Message {
            id: fields.message_id,
            conversation_id: fields.conversation_id,
            sender_id: fields.sender_id,
            sender_type: fields.sender_type,
            content: fields.content,
            message_type: fields.message_type,
            created_at: Utc::now(),
            read_at: None,
        };
        log.push(message.clone());
        Ok(message)
    }

    async fn conversation_messages(
        &self,
        conversation_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        self.check("conversation_messages")?;
        let mut log = self
            .messages
            .read()
            .await
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default();
        log.sort_by_key(|m| m.created_at);
        let limit = limit.max(0) as usize;
        if log.len() > limit {
            log = log.split_off(log.len() - limit);
        }
        Ok(log)
    }

    async fn mark_read(
        &self,
        conversation_id: Uuid,
        reader: Role,
        message_ids: Option<Vec<Uuid>>,
    ) -> Result<Vec<Uuid>, StoreError> {
        self.check("mark_read")?;
        let wanted: Option<HashSet<Uuid>> = message_ids.map(|ids| ids.into_iter().collect());
        let now = Utc::now();
        let mut marked = Vec::new();
        let mut messages = self.messages.write().await;
        if let Some(log) = messages.get_mut(&conversation_id) {
            for message in log.iter_mut() {
                let selected = wanted.as_ref().map_or(true, |ids| ids.contains(&message.id));
                if selected && message.is_unread_for(reader) {
                    message.read_at = Some(now);
                    if !marked.contains(&message.id) {
                        marked.push(message.id);
                    }
                }
            }
        }
        Ok(marked)
    }

    async fn property_unread_counts(
        &self,
        conversation_id: Uuid,
    ) -> Result<PropertyUnreadCounts, StoreError> {
        self.check("property_unread_counts")?;
        Ok(PropertyUnreadCounts {
            agent_unread_count: self.conversation_unread(conversation_id, Role::Agent).await,
            client_unread_count: self.conversation_unread(conversation_id, Role::Client).await,
        })
    }

    async fn agent_unread_tree(&self, agent_id: Uuid) -> Result<AgentUnreadTree, StoreError> {
        self.check("agent_unread_tree")?;
        let owned: Vec<Conversation> = self
            .conversations
            .read()
            .await
            .values()
            .filter(|c| c.agent_id == agent_id)
            .cloned()
            .collect();
        let mut rows = Vec::new();
        for conversation in owned {
            let unread = self.conversation_unread(conversation.id, Role::Agent).await;
            if unread > 0 {
                rows.push((conversation.client_id, conversation.property_id, unread));
            }
        }
        Ok(AgentUnreadTree::from_rows(rows))
    }

    async fn client_unread_counts(
        &self,
        client_id: Uuid,
    ) -> Result<ClientUnreadCounts, StoreError> {
        self.check("client_unread_counts")?;
        let owned: Vec<Conversation> = self
            .conversations
            .read()
            .await
            .values()
            .filter(|c| c.client_id == client_id)
            .cloned()
            .collect();
        let mut counts = ClientUnreadCounts {
            client_id,
            ..ClientUnreadCounts::default()
        };
        for conversation in owned {
            let unread = self.conversation_unread(conversation.id, Role::Client).await;
            counts.unread_counts.insert(conversation.property_id, unread);
        }
        Ok(counts)
    }
}
