use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use homeward_core::{
    unread::PropertyUnreadCounts, AgentUnreadTree, ClientUnreadCounts, Conversation, Message,
    MessageType, Role,
};
use sqlx::FromRow;
use uuid::Uuid;

use crate::StoragePool;

/// Conversations, messages and the unread aggregates derived from them.
#[derive(Clone)]
pub struct MessagingRepository {
    pool: StoragePool,
}

#[derive(Debug, Clone)]
pub struct NewConversation {
    pub property_id: Uuid,
    pub timeline_id: Uuid,
    pub agent_id: Uuid,
    pub client_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub sender_type: Role,
    pub content: String,
    pub message_type: MessageType,
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    conversation_id: Uuid,
    property_id: Uuid,
    timeline_id: Uuid,
    agent_id: Uuid,
    client_id: Uuid,
    created_at: DateTime<Utc>,
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        Conversation {
            id: row.conversation_id,
            property_id: row.property_id,
            timeline_id: row.timeline_id,
            agent_id: row.agent_id,
            client_id: row.client_id,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    message_id: Uuid,
    conversation_id: Uuid,
    sender_id: Uuid,
    sender_type: String,
    content: String,
    message_type: String,
    created_at: DateTime<Utc>,
    read_at: Option<DateTime<Utc>>,
}

impl TryFrom<MessageRow> for Message {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        let sender_type = row
            .sender_type
            .parse::<Role>()
            .map_err(|err| anyhow!("message {}: {err}", row.message_id))?;
        Ok(Message {
            id: row.message_id,
            conversation_id: row.conversation_id,
            sender_id: row.sender_id,
            sender_type,
            content: row.content,
            message_type: MessageType::parse(&row.message_type).unwrap_or_default(),
            created_at: row.created_at,
            read_at: row.read_at,
        })
    }
}

const CONVERSATION_COLUMNS: &str =
    "conversation_id, property_id, timeline_id, agent_id, client_id, created_at";
const MESSAGE_COLUMNS: &str =
    "message_id, conversation_id, sender_id, sender_type, content, message_type, created_at, read_at";

impl MessagingRepository {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }

    pub async fn find_conversation_by_property(
        &self,
        property_id: Uuid,
    ) -> Result<Option<Conversation>> {
        let row = sqlx::query_as::<_, ConversationRow>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE property_id = $1"
        ))
        .bind(property_id)
        .fetch_optional(self.pool.pool())
        .await?;
        Ok(row.map(Conversation::from))
    }

    pub async fn find_conversation(&self, conversation_id: Uuid) -> Result<Option<Conversation>> {
        let row = sqlx::query_as::<_, ConversationRow>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE conversation_id = $1"
        ))
        .bind(conversation_id)
        .fetch_optional(self.pool.pool())
        .await?;
        Ok(row.map(Conversation::from))
    }

    /// Create the property's conversation unless another writer got there first.
    ///
    /// Either way the single stored conversation for the property is returned.
    pub async fn create_conversation(&self, fields: &NewConversation) -> Result<Conversation> {
        sqlx::query(
            r#"
            INSERT INTO conversations (conversation_id, property_id, timeline_id, agent_id, client_id)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (property_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(fields.property_id)
        .bind(fields.timeline_id)
        .bind(fields.agent_id)
        .bind(fields.client_id)
        .execute(self.pool.pool())
        .await?;

        self.find_conversation_by_property(fields.property_id)
            .await?
            .ok_or_else(|| anyhow!("conversation for property {} vanished", fields.property_id))
    }

    /// Store a message; replaying the same id returns the original row.
    pub async fn append_message(&self, fields: &NewMessage) -> Result<Message> {
        sqlx::query(
            r#"
            INSERT INTO messages (message_id, conversation_id, sender_id, sender_type, content, message_type)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (message_id) DO NOTHING
            "#,
        )
        .bind(fields.message_id)
        .bind(fields.conversation_id)
        .bind(fields.sender_id)
        .bind(fields.sender_type.as_str())
        .bind(&fields.content)
        .bind(fields.message_type.as_str())
        .execute(self.pool.pool())
        .await?;

        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_id = $1"
        ))
        .bind(fields.message_id)
        .fetch_one(self.pool.pool())
        .await?;
        Message::try_from(row)
    }

    /// Most recent `limit` messages in chronological order.
    pub async fn conversation_messages(
        &self,
        conversation_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE conversation_id = $1
            ORDER BY created_at DESC, seq DESC
            LIMIT $2
            "#
        ))
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await?;

        rows.into_iter().rev().map(Message::try_from).collect()
    }

    /// Mark messages addressed to `reader` as read, optionally limited to `message_ids`.
    ///
    /// Returns the ids that flipped from unread to read.
    pub async fn mark_read(
        &self,
        conversation_id: Uuid,
        reader: Role,
        message_ids: Option<&[Uuid]>,
    ) -> Result<Vec<Uuid>> {
        let ids = match message_ids {
            Some(ids) => {
                sqlx::query_scalar::<_, Uuid>(
                    r#"
                    UPDATE messages
                    SET read_at = NOW()
                    WHERE conversation_id = $1
                      AND sender_type <> $2
                      AND read_at IS NULL
                      AND message_id = ANY($3)
                    RETURNING message_id
                    "#,
                )
                .bind(conversation_id)
                .bind(reader.as_str())
                .bind(ids)
                .fetch_all(self.pool.pool())
                .await?
            }
            None => {
                sqlx::query_scalar::<_, Uuid>(
                    r#"
                    UPDATE messages
                    SET read_at = NOW()
                    WHERE conversation_id = $1
                      AND sender_type <> $2
                      AND read_at IS NULL
                    RETURNING message_id
                    "#,
                )
                .bind(conversation_id)
                .bind(reader.as_str())
                .fetch_all(self.pool.pool())
                .await?
            }
        };
        Ok(ids)
    }

    pub async fn property_unread_counts(
        &self,
        conversation_id: Uuid,
    ) -> Result<PropertyUnreadCounts> {
        let (agent_unread, client_unread) = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE sender_type = 'client' AND read_at IS NULL),
                COUNT(*) FILTER (WHERE sender_type = 'agent' AND read_at IS NULL)
            FROM messages
            WHERE conversation_id = $1
            "#,
        )
        .bind(conversation_id)
        .fetch_one(self.pool.pool())
        .await?;

        Ok(PropertyUnreadCounts {
            agent_unread_count: agent_unread.max(0) as u64,
            client_unread_count: client_unread.max(0) as u64,
        })
    }

    pub async fn agent_unread_tree(&self, agent_id: Uuid) -> Result<AgentUnreadTree> {
        let rows = sqlx::query_as::<_, (Uuid, Uuid, i64)>(
            r#"
            SELECT c.client_id, c.property_id, COUNT(m.message_id)
            FROM conversations c
            JOIN messages m ON m.conversation_id = c.conversation_id
            WHERE c.agent_id = $1
              AND m.sender_type = 'client'
              AND m.read_at IS NULL
            GROUP BY c.client_id, c.property_id
            "#,
        )
        .bind(agent_id)
        .fetch_all(self.pool.pool())
        .await?;

        Ok(AgentUnreadTree::from_rows(rows.into_iter().map(
            |(client_id, property_id, count)| (client_id, property_id, count.max(0) as u64),
        )))
    }

    pub async fn client_unread_counts(&self, client_id: Uuid) -> Result<ClientUnreadCounts> {
        let rows = sqlx::query_as::<_, (Uuid, i64)>(
            r#"
            SELECT c.property_id, COUNT(m.message_id) FILTER (
                WHERE m.sender_type = 'agent' AND m.read_at IS NULL
            )
            FROM conversations c
            LEFT JOIN messages m ON m.conversation_id = c.conversation_id
            WHERE c.client_id = $1
            GROUP BY c.property_id
            "#,
        )
        .bind(client_id)
        .fetch_all(self.pool.pool())
        .await?;

        Ok(ClientUnreadCounts {
            client_id,
            unread_counts: rows
                .into_iter()
                .map(|(property_id, count)| (property_id, count.max(0) as u64))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;

    #[tokio::test]
    async fn conversation_creation_is_idempotent_when_database_available() -> anyhow::Result<()> {
        let Some(pool) = test_pool("conversation upsert test").await? else {
            return Ok(());
        };
        let repo = MessagingRepository::new(pool.clone());

        let agent_id = Uuid::new_v4();
        let client_id = Uuid::new_v4();
        let timeline_id = Uuid::new_v4();
        let property_id = Uuid::new_v4();
        sqlx::query("INSERT INTO timelines (timeline_id) VALUES ($1)")
            .bind(timeline_id)
            .execute(pool.pool())
            .await?;
        sqlx::query("INSERT INTO properties (property_id, timeline_id) VALUES ($1, $2)")
            .bind(property_id)
            .bind(timeline_id)
            .execute(pool.pool())
            .await?;

        let fields = NewConversation {
            property_id,
            timeline_id,
            agent_id,
            client_id,
        };
        let (first, second) = tokio::join!(
            repo.create_conversation(&fields),
            repo.create_conversation(&fields)
        );
        let (first, second) = (first?, second?);
        assert_eq!(first.id, second.id);

        let message = NewMessage {
            message_id: Uuid::new_v4(),
            conversation_id: first.id,
            sender_id: client_id,
            sender_type: Role::Client,
            content: "Hello".into(),
            message_type: MessageType::Text,
        };
        repo.append_message(&message).await?;
        repo.append_message(&message).await?;

        let history = repo.conversation_messages(first.id, 50).await?;
        assert_eq!(history.len(), 1);

        let counts = repo.property_unread_counts(first.id).await?;
        assert_eq!(counts.agent_unread_count, 1);
        assert_eq!(counts.client_unread_count, 0);

        let tree = repo.agent_unread_tree(agent_id).await?;
        assert_eq!(tree.total_unread, 1);

        let marked = repo.mark_read(first.id, Role::Agent, None).await?;
        assert_eq!(marked, vec![message.message_id]);
        assert_eq!(repo.agent_unread_tree(agent_id).await?.total_unread, 0);

        sqlx::query("DELETE FROM timelines WHERE timeline_id = $1")
            .bind(timeline_id)
            .execute(pool.pool())
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn history_keeps_arrival_order_for_equal_timestamps() -> anyhow::Result<()> {
        let Some(pool) = test_pool("history tie order test").await? else {
            return Ok(());
        };
        let repo = MessagingRepository::new(pool.clone());
        let timeline_id = Uuid::new_v4();
        let property_id = Uuid::new_v4();
        sqlx::query("INSERT INTO timelines (timeline_id) VALUES ($1)")
            .bind(timeline_id)
            .execute(pool.pool())
            .await?;
        sqlx::query("INSERT INTO properties (property_id, timeline_id) VALUES ($1, $2)")
            .bind(property_id)
            .bind(timeline_id)
            .execute(pool.pool())
            .await?;
        let conversation = repo
            .create_conversation(&NewConversation {
                property_id,
                timeline_id,
                agent_id: Uuid::new_v4(),
                client_id: Uuid::new_v4(),
            })
            .await?;

        let stamp = Utc::now();
        let mut inserted = Vec::new();
        for content in ["first", "second", "third"] {
            let message_id = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO messages (message_id, conversation_id, sender_id, sender_type, content, created_at) \
                 VALUES ($1, $2, $3, 'client', $4, $5)",
            )
            .bind(message_id)
            .bind(conversation.id)
            .bind(conversation.client_id)
            .bind(content)
            .bind(stamp)
            .execute(pool.pool())
            .await?;
            inserted.push(message_id);
        }

        let history = repo.conversation_messages(conversation.id, 2).await?;
        let ids: Vec<Uuid> = history.iter().map(|message| message.id).collect();
        assert_eq!(ids, inserted[1..].to_vec());

        sqlx::query("DELETE FROM timelines WHERE timeline_id = $1")
            .bind(timeline_id)
            .execute(pool.pool())
            .await?;
        Ok(())
    }
}
