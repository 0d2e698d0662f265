use std::sync::Arc;

use homeward_core::{
    dedupe_messages,
    event::{MarkMessagesRead, MessageRead, NewMessage as NewMessageEvent, SendPropertyMessage},
    Conversation, EventFrame, EventName, Identity, Message, MessageType,
};
use homeward_storage::NewMessage;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    badges::{BadgeEngine, BadgeReport},
    conversation::{ConversationResolver, NotFoundReason, ResolveError, Resolution},
    lifecycle::Connection,
    store::{GatewayStore, StoreError},
    transport::{GroupKey, Hub},
};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    InvalidPayload(String),
    #[error("anonymous connections cannot send or read messages")]
    AnonymousSender,
    #[error("{}", .0.describe())]
    NotFound(NotFoundReason),
    #[error("not permitted to access this conversation")]
    Unauthorized,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ResolveError> for PipelineError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Unauthorized => PipelineError::Unauthorized,
            ResolveError::Store(err) => PipelineError::Store(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Sent {
    pub message: Message,
    pub conversation: Conversation,
    pub badges: BadgeReport,
}

#[derive(Debug, Clone)]
pub struct MarkedRead {
    pub conversation: Conversation,
    pub message_ids: Vec<Uuid>,
    pub badges: BadgeReport,
}

#[derive(Clone)]
pub struct PipelineLimits {
    pub max_message_length: usize,
    pub history_limit: i64,
}

/// Validates, persists and fans out messages, then settles badge counts.
#[derive(Clone)]
pub struct MessagePipeline {
    store: Arc<dyn GatewayStore>,
    conversations: ConversationResolver,
    badges: BadgeEngine,
    hub: Hub,
    limits: PipelineLimits,
}

impl MessagePipeline {
    pub fn new(
        store: Arc<dyn GatewayStore>,
        conversations: ConversationResolver,
        badges: BadgeEngine,
        hub: Hub,
        limits: PipelineLimits,
    ) -> Self {
        Self {
            store,
            conversations,
            badges,
            hub,
            limits,
        }
    }

    /// Recent history for a newly joined member, ordered and free of repeats.
    pub async fn history(&self, conversation: &Conversation) -> Result<Vec<Message>, StoreError> {
        let messages = self
            .store
            .conversation_messages(conversation.id, self.limits.history_limit)
            .await?;
        Ok(dedupe_messages(messages))
    }

    pub async fn send(
        &self,
        connection: &Connection,
        request: SendPropertyMessage,
    ) -> Result<Sent, PipelineError> {
        let content = request.content.trim();
        if content.is_empty() {
            return Err(PipelineError::InvalidPayload(
                "message content is required".into(),
            ));
        }
        if content.chars().count() > self.limits.max_message_length {
            return Err(PipelineError::InvalidPayload(format!(
                "message content exceeds {} characters",
                self.limits.max_message_length
            )));
        }
        let message_type = match request.message_type.as_deref() {
            None => MessageType::default(),
            Some(raw) => match MessageType::parse(raw) {
                Some(MessageType::System) => {
                    return Err(PipelineError::InvalidPayload(
                        "system messages cannot be sent by users".into(),
                    ))
                }
                Some(kind) => kind,
                None => {
                    return Err(PipelineError::InvalidPayload(format!(
                        "unsupported message type '{raw}'"
                    )))
                }
            },
        };
        reject_anonymous(connection)?;

        let conversation = self
            .locate(connection, request.conversation_id, request.property_id)
            .await?;

        // Synthetic callers write under the conversation's real participant id.
        let sender_id = conversation.participant(connection.role);
        let message = self
            .store
            .append_message(NewMessage {
                message_id: Uuid::new_v4(),
                conversation_id: conversation.id,
                sender_id,
                sender_type: connection.role,
                content: content.to_string(),
                message_type,
            })
            .await?;

        tracing::info!(
            message_id = %message.id,
            conversation_id = %conversation.id,
            sender = %connection.user_id(),
            "message stored"
        );

        self.broadcast(
            &GroupKey::property(conversation.property_id),
            EventName::NewMessage,
            &NewMessageEvent {
                message: message.clone(),
                property_id: conversation.property_id,
            },
        )
        .await;

        let badges = self.badges.reconcile(&conversation).await;
        Ok(Sent {
            message,
            conversation,
            badges,
        })
    }

    pub async fn mark_read(
        &self,
        connection: &Connection,
        request: MarkMessagesRead,
    ) -> Result<MarkedRead, PipelineError> {
        reject_anonymous(connection)?;
        let conversation = self
            .locate(connection, request.conversation_id, request.property_id)
            .await?;

        let message_ids = self
            .store
            .mark_read(conversation.id, connection.role, request.message_ids)
            .await?;

        if !message_ids.is_empty() {
            self.broadcast(
                &GroupKey::property(conversation.property_id),
                EventName::MessageRead,
                &MessageRead {
                    conversation_id: conversation.id,
                    property_id: conversation.property_id,
                    reader_id: connection.user_id().to_string(),
                    reader_type: connection.role,
                    message_ids: message_ids.clone(),
                },
            )
            .await;
        }

        let badges = self.badges.reconcile(&conversation).await;
        Ok(MarkedRead {
            conversation,
            message_ids,
            badges,
        })
    }

    async fn locate(
        &self,
        connection: &Connection,
        conversation_id: Option<Uuid>,
        property_id: Option<Uuid>,
    ) -> Result<Conversation, PipelineError> {
        let resolution = match (conversation_id, property_id) {
            (Some(conversation_id), _) => {
                self.conversations
                    .find_by_id(conversation_id, &connection.identity, connection.role)
                    .await?
            }
            (None, Some(property_id)) => {
                self.conversations
                    .get_or_create(property_id, &connection.identity, connection.role)
                    .await?
            }
            (None, None) => {
                return Err(PipelineError::InvalidPayload(
                    "propertyId or conversationId is required".into(),
                ))
            }
        };
        match resolution {
            Resolution::Found(conversation) => Ok(conversation),
            Resolution::NotFound(reason) => Err(PipelineError::NotFound(reason)),
        }
    }

    async fn broadcast<T: serde::Serialize>(&self, group: &GroupKey, event: EventName, payload: &T) {
        match EventFrame::new(event, payload) {
            Ok(frame) => {
                self.hub.emit_to_group(group, Arc::new(frame)).await;
            }
            Err(err) => tracing::error!(error = %err, %event, "failed to encode broadcast"),
        }
    }
}

fn reject_anonymous(connection: &Connection) -> Result<(), PipelineError> {
    if matches!(connection.identity, Identity::Anonymous { .. }) {
        return Err(PipelineError::AnonymousSender);
    }
    Ok(())
}
