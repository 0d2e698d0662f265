use std::sync::Arc;

use homeward_core::{
    event::{HierarchicalUnreadCountsUpdated, UnreadCountsUpdated},
    Conversation, EventFrame, EventName,
};
use serde::Serialize;

use crate::{
    store::GatewayStore,
    transport::{GroupKey, Hub},
};

/// Which of the three badge views were recomputed and broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BadgeReport {
    pub property: bool,
    pub agent: bool,
    pub client: bool,
}

/// Recomputes the per-property, per-agent and per-client unread views after
/// message state changes. Each view is computed and broadcast on its own;
/// a failure in one is logged and does not stop the others.
#[derive(Clone)]
pub struct BadgeEngine {
    store: Arc<dyn GatewayStore>,
    hub: Hub,
}

impl BadgeEngine {
    pub fn new(store: Arc<dyn GatewayStore>, hub: Hub) -> Self {
        Self { store, hub }
    }

    pub async fn reconcile(&self, conversation: &Conversation) -> BadgeReport {
        let (property, agent, client) = tokio::join!(
            self.property_view(conversation),
            self.agent_view(conversation),
            self.client_view(conversation),
        );
        BadgeReport {
            property,
            agent,
            client,
        }
    }

    async fn property_view(&self, conversation: &Conversation) -> bool {
        match self.store.property_unread_counts(conversation.id).await {
            Ok(counts) => {
                let payload = UnreadCountsUpdated {
                    property_id: conversation.property_id,
                    conversation_id: conversation.id,
                    counts,
                };
                self.broadcast(
                    &[GroupKey::property(conversation.property_id)],
                    EventName::UnreadCountsUpdated,
                    &payload,
                )
                .await
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    conversation_id = %conversation.id,
                    "failed to recompute property unread counts"
                );
                false
            }
        }
    }

    async fn agent_view(&self, conversation: &Conversation) -> bool {
        match self.store.agent_unread_tree(conversation.agent_id).await {
            Ok(tree) => {
                let payload = HierarchicalUnreadCountsUpdated {
                    agent_id: conversation.agent_id,
                    tree,
                };
                self.broadcast(
                    &[GroupKey::agent(conversation.agent_id)],
                    EventName::HierarchicalUnreadCountsUpdated,
                    &payload,
                )
                .await
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    agent_id = %conversation.agent_id,
                    "failed to recompute agent unread tree"
                );
                false
            }
        }
    }

    async fn client_view(&self, conversation: &Conversation) -> bool {
        match self.store.client_unread_counts(conversation.client_id).await {
            Ok(counts) => {
                // Clients without a durable login only sit in the timeline group.
                self.broadcast(
                    &[
                        GroupKey::client(conversation.client_id),
                        GroupKey::timeline(&conversation.timeline_id.to_string()),
                    ],
                    EventName::ClientUnreadCountsUpdated,
                    &counts,
                )
                .await
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    client_id = %conversation.client_id,
                    "failed to recompute client unread counts"
                );
                false
            }
        }
    }

    async fn broadcast<T: Serialize>(&self, groups: &[GroupKey], event: EventName, payload: &T) -> bool {
        let frame = match EventFrame::new(event, payload) {
            Ok(frame) => Arc::new(frame),
            Err(err) => {
                tracing::error!(error = %err, %event, "failed to encode badge update");
                return false;
            }
        };
        self.hub.emit_to_groups(groups, frame).await;
        true
    }
}
