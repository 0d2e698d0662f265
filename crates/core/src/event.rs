//! Wire protocol: event names, the JSON frame envelope, and payload shapes.
//!
//! Every frame is `{"event": <name>, "data": <payload>}` with camelCase
//! payload fields. Names are shared with existing web clients and must not
//! change.

use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    identity::Role,
    messaging::{Conversation, Message},
    unread::{AgentUnreadTree, PropertyUnreadCounts},
};

macro_rules! event_names {
    ($($variant:ident => $wire:literal),+ $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum EventName {
            $($variant),+
        }

        impl EventName {
            pub const ALL: &'static [EventName] = &[$(EventName::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(EventName::$variant => $wire),+
                }
            }

            pub fn parse(raw: &str) -> Option<Self> {
                match raw {
                    $($wire => Some(EventName::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

event_names! {
    Connected => "connected",
    Error => "error",
    JoinPropertyConversation => "join-property-conversation",
    PropertyConversationJoined => "property-conversation-joined",
    LeavePropertyConversation => "leave-property-conversation",
    PropertyConversationLeft => "property-conversation-left",
    SendPropertyMessage => "send-property-message",
    NewMessage => "new-message",
    MessageSent => "message-sent",
    MessageError => "message-error",
    MarkMessagesRead => "mark-messages-read",
    MessagesMarkedRead => "messages-marked-read",
    MessageRead => "message-read",
    Ping => "ping",
    Pong => "pong",
    UnreadCountsUpdated => "unreadCountsUpdated",
    HierarchicalUnreadCountsUpdated => "hierarchicalUnreadCountsUpdated",
    ClientUnreadCountsUpdated => "clientUnreadCountsUpdated",
    UserTyping => "user-typing",
    TypingStart => "typing-start",
    TypingStop => "typing-stop",
    PresenceUpdated => "presence-updated",
    Ack => "ack",
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// JSON envelope carried by every text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl EventFrame {
    pub fn new<T: Serialize>(event: EventName, data: &T) -> Result<Self, FrameError> {
        Ok(Self {
            event: event.as_str().to_string(),
            data: serde_json::to_value(data)?,
        })
    }

    pub fn decode(text: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn name(&self) -> Option<EventName> {
        EventName::parse(&self.event)
    }

    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

// Inbound payloads.

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyRef {
    pub property_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendPropertyMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<Uuid>,
    pub content: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkMessagesRead {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_ids: Option<Vec<Uuid>>,
}

// Outbound payloads.

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connected {
    pub connection_id: Uuid,
    pub user_id: String,
    pub user_type: Role,
    pub identity: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStatus {
    Joined,
    AlreadyJoined,
    PropertyNotFound,
    TimelineNotFound,
    ClientNotFound,
    AgentNotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyConversationJoined {
    pub property_id: Uuid,
    pub conversation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<Conversation>,
    pub messages: Vec<Message>,
    pub status: JoinStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    #[serde(flatten)]
    pub message: Message,
    pub property_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSent {
    pub message: Message,
    pub property_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesMarkedRead {
    pub conversation_id: Option<Uuid>,
    pub property_id: Option<Uuid>,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRead {
    pub conversation_id: Uuid,
    pub property_id: Uuid,
    pub reader_id: String,
    pub reader_type: Role,
    pub message_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCountsUpdated {
    pub property_id: Uuid,
    pub conversation_id: Uuid,
    #[serde(flatten)]
    pub counts: PropertyUnreadCounts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchicalUnreadCountsUpdated {
    pub agent_id: Uuid,
    #[serde(flatten)]
    pub tree: AgentUnreadTree,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTyping {
    pub property_id: Uuid,
    pub user_id: String,
    pub user_type: Role,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdated {
    pub user_id: String,
    pub user_type: Role,
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pong {
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub event: String,
}
