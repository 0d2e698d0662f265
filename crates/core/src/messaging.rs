use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::Role;

/// Thread of messages between one agent and one client about one property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub property_id: Uuid,
    pub timeline_id: Uuid,
    pub agent_id: Uuid,
    pub client_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// Durable id occupying the given role's slot.
    pub fn participant(&self, role: Role) -> Uuid {
        match role {
            Role::Agent => self.agent_id,
            Role::Client => self.client_id,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
    System,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::File => "file",
            MessageType::System => "system",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "text" => Some(MessageType::Text),
            "image" => Some(MessageType::Image),
            "file" => Some(MessageType::File),
            "system" => Some(MessageType::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub sender_type: Role,
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Whether this message still counts towards `reader`'s unread badge.
    pub fn is_unread_for(&self, reader: Role) -> bool {
        self.sender_type != reader && self.read_at.is_none()
    }
}

/// Collapse repeated deliveries of the same message.
///
/// Messages are ordered by `created_at` (stable, so equal timestamps keep
/// arrival order) and only the first occurrence of each id survives.
pub fn dedupe_messages(mut messages: Vec<Message>) -> Vec<Message> {
    messages.sort_by_key(|m| m.created_at);
    let mut seen = HashSet::with_capacity(messages.len());
    messages.retain(|m| seen.insert(m.id));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn message(id: Uuid, offset_secs: i64, content: &str) -> Message {
        Message {
            id,
            conversation_id: Uuid::nil(),
            sender_id: Uuid::nil(),
            sender_type: Role::Client,
            content: content.to_string(),
            message_type: MessageType::Text,
            created_at: Utc.timestamp_opt(offset_secs, 0).unwrap(),
            read_at: None,
        }
    }

    #[test]
    fn triplicate_collapses_to_earliest_copy() {
        let id = Uuid::new_v4();
        let other = Uuid::new_v4();
        let messages = vec![
            message(id, 30, "late"),
            message(other, 20, "other"),
            message(id, 10, "early"),
            message(id, 50, "latest"),
        ];

        let deduped = dedupe_messages(messages);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].id, id);
        assert_eq!(deduped[0].content, "early");
        assert_eq!(deduped[1].id, other);
    }

    #[test]
    fn equal_timestamps_keep_arrival_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let deduped = dedupe_messages(vec![message(b, 5, "b"), message(a, 5, "a")]);
        assert_eq!(deduped[0].id, b);
        assert_eq!(deduped[1].id, a);
    }

    #[test]
    fn wire_shape_uses_type_and_camel_case() {
        let value = serde_json::to_value(message(Uuid::nil(), 0, "hi")).unwrap();
        assert_eq!(value["type"], "text");
        assert_eq!(value["senderType"], "client");
        assert!(value.get("conversationId").is_some());
        assert!(value.get("readAt").is_none());
    }

    #[test]
    fn own_messages_are_never_unread() {
        let msg = message(Uuid::new_v4(), 0, "hello");
        assert!(!msg.is_unread_for(Role::Client));
        assert!(msg.is_unread_for(Role::Agent));
    }

    proptest! {
        #[test]
        fn dedupe_yields_unique_sorted_ids(offsets in proptest::collection::vec((0u8..6, 0i64..1000), 0..64)) {
            let ids: Vec<Uuid> = (0..6).map(|_| Uuid::new_v4()).collect();
            let messages: Vec<Message> = offsets
                .iter()
                .map(|(idx, offset)| message(ids[*idx as usize], *offset, "x"))
                .collect();
            let distinct: HashSet<Uuid> = messages.iter().map(|m| m.id).collect();

            let deduped = dedupe_messages(messages.clone());
            prop_assert_eq!(deduped.len(), distinct.len());
            prop_assert!(deduped.windows(2).all(|w| w[0].created_at <= w[1].created_at));
            for kept in &deduped {
                let earliest = messages
                    .iter()
                    .filter(|m| m.id == kept.id)
                    .map(|m| m.created_at)
                    .min()
                    .unwrap();
                prop_assert_eq!(kept.created_at, earliest);
            }
        }
    }
}
