use std::sync::Arc;

use homeward_core::{event::JoinStatus, Conversation, Identity, Role, SyntheticSource};
use homeward_storage::NewConversation;
use thiserror::Error;
use uuid::Uuid;

use crate::store::{GatewayStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundReason {
    Property,
    Timeline,
    Client,
    Agent,
    Conversation,
}

impl NotFoundReason {
    pub fn describe(&self) -> &'static str {
        match self {
            NotFoundReason::Property => "property not found",
            NotFoundReason::Timeline => "property has no timeline",
            NotFoundReason::Client => "timeline has no client",
            NotFoundReason::Agent => "no agent available for this property",
            NotFoundReason::Conversation => "conversation not found",
        }
    }

    pub fn join_status(&self) -> JoinStatus {
        match self {
            NotFoundReason::Property | NotFoundReason::Conversation => JoinStatus::PropertyNotFound,
            NotFoundReason::Timeline => JoinStatus::TimelineNotFound,
            NotFoundReason::Client => JoinStatus::ClientNotFound,
            NotFoundReason::Agent => JoinStatus::AgentNotFound,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(Conversation),
    NotFound(NotFoundReason),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("not permitted to access this conversation")]
    Unauthorized,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Finds or lazily creates the single conversation attached to a property.
#[derive(Clone)]
pub struct ConversationResolver {
    store: Arc<dyn GatewayStore>,
    permit_unverified_access: bool,
}

impl ConversationResolver {
    pub fn new(store: Arc<dyn GatewayStore>, permit_unverified_access: bool) -> Self {
        Self {
            store,
            permit_unverified_access,
        }
    }

    pub async fn get_or_create(
        &self,
        property_id: Uuid,
        identity: &Identity,
        role: Role,
    ) -> Result<Resolution, ResolveError> {
        if let Some(existing) = self.store.find_conversation_by_property(property_id).await? {
            self.authorize(&existing, identity, role)?;
            return Ok(Resolution::Found(existing));
        }

        let Some(context) = self.store.find_property_context(property_id).await? else {
            return Ok(Resolution::NotFound(NotFoundReason::Property));
        };
        let Some(timeline_id) = context.timeline_id else {
            return Ok(Resolution::NotFound(NotFoundReason::Timeline));
        };
        let Some(client_id) = context.client_id else {
            return Ok(Resolution::NotFound(NotFoundReason::Client));
        };

        let caller_agent = match (role, identity) {
            (Role::Agent, Identity::Verified { .. }) => identity.account_id(),
            _ => None,
        };
        let agent_id = match caller_agent
            .or(context.client_agent_id)
            .or(context.timeline_agent_id)
        {
            Some(agent_id) => agent_id,
            None => match self.store.any_active_agent().await? {
                Some(agent_id) => {
                    tracing::info!(
                        %property_id,
                        %agent_id,
                        "property has no linked agent; assigning first active agent"
                    );
                    agent_id
                }
                None => return Ok(Resolution::NotFound(NotFoundReason::Agent)),
            },
        };

        let candidate = NewConversation {
            property_id,
            timeline_id,
            agent_id,
            client_id,
        };
        self.authorize_fields(&candidate, identity, role)?;

        let conversation = self.store.create_conversation(candidate).await?;
        self.authorize(&conversation, identity, role)?;
        tracing::debug!(
            conversation_id = %conversation.id,
            %property_id,
            "conversation resolved"
        );
        Ok(Resolution::Found(conversation))
    }

    pub async fn find_by_id(
        &self,
        conversation_id: Uuid,
        identity: &Identity,
        role: Role,
    ) -> Result<Resolution, ResolveError> {
        match self.store.find_conversation(conversation_id).await? {
            Some(conversation) => {
                self.authorize(&conversation, identity, role)?;
                Ok(Resolution::Found(conversation))
            }
            None => Ok(Resolution::NotFound(NotFoundReason::Conversation)),
        }
    }

    pub fn authorize(
        &self,
        conversation: &Conversation,
        identity: &Identity,
        role: Role,
    ) -> Result<(), ResolveError> {
        self.check(
            conversation.participant(role),
            conversation.timeline_id,
            identity,
            role,
        )
    }

    fn authorize_fields(
        &self,
        fields: &NewConversation,
        identity: &Identity,
        role: Role,
    ) -> Result<(), ResolveError> {
        let slot = match role {
            Role::Agent => fields.agent_id,
            Role::Client => fields.client_id,
        };
        self.check(slot, fields.timeline_id, identity, role)
    }

    fn check(
        &self,
        slot: Uuid,
        timeline_id: Uuid,
        identity: &Identity,
        role: Role,
    ) -> Result<(), ResolveError> {
        let permitted = match identity {
            Identity::Verified { .. } => identity.account_id() == Some(slot),
            Identity::Synthetic {
                derived_from: SyntheticSource::Timeline(claimed),
                ..
            } => {
                self.permit_unverified_access
                    && role == Role::Client
                    && claimed.as_str() == timeline_id.to_string()
            }
            Identity::Synthetic { .. } | Identity::Anonymous { .. } => {
                self.permit_unverified_access
            }
        };
        if permitted {
            Ok(())
        } else {
            Err(ResolveError::Unauthorized)
        }
    }
}
