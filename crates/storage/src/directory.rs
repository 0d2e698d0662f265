use anyhow::Result;
use sqlx::FromRow;
use uuid::Uuid;

use crate::StoragePool;

/// Read-only lookups over agents, clients, timelines and properties.
#[derive(Clone)]
pub struct DirectoryRepository {
    pool: StoragePool,
}

/// A property joined with its timeline and the timeline's client.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct PropertyContext {
    pub property_id: Uuid,
    pub timeline_id: Option<Uuid>,
    pub timeline_agent_id: Option<Uuid>,
    pub client_id: Option<Uuid>,
    pub client_agent_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct TimelineClient {
    pub timeline_id: Uuid,
    pub client_id: Uuid,
    pub agent_id: Option<Uuid>,
}

impl DirectoryRepository {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }

    pub async fn property_context(&self, property_id: Uuid) -> Result<Option<PropertyContext>> {
        let context = sqlx::query_as::<_, PropertyContext>(
            r#"
            SELECT p.property_id,
                   t.timeline_id,
                   t.agent_id AS timeline_agent_id,
                   c.client_id,
                   c.agent_id AS client_agent_id
            FROM properties p
            LEFT JOIN timelines t ON t.timeline_id = p.timeline_id
            LEFT JOIN clients c ON c.client_id = t.client_id
            WHERE p.property_id = $1
            "#,
        )
        .bind(property_id)
        .fetch_optional(self.pool.pool())
        .await?;
        Ok(context)
    }

    pub async fn timeline_client(&self, timeline_id: Uuid) -> Result<Option<TimelineClient>> {
        let client = sqlx::query_as::<_, TimelineClient>(
            r#"
            SELECT t.timeline_id, c.client_id, COALESCE(c.agent_id, t.agent_id) AS agent_id
            FROM timelines t
            JOIN clients c ON c.client_id = t.client_id
            WHERE t.timeline_id = $1
            "#,
        )
        .bind(timeline_id)
        .fetch_optional(self.pool.pool())
        .await?;
        Ok(client)
    }

    /// Oldest active agent, used when a client's record links to none.
    pub async fn any_active_agent(&self) -> Result<Option<Uuid>> {
        let agent = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT agent_id
            FROM agents
            WHERE active
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(self.pool.pool())
        .await?;
        Ok(agent)
    }
}
