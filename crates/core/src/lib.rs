//! Core domain types, wire protocol and message ordering for Homeward.

pub mod event;
pub mod identity;
pub mod messaging;
pub mod unread;

pub use event::{EventFrame, EventName};
pub use identity::{Identity, Role, SyntheticSource, UserKey, VerifiedSource};
pub use messaging::{dedupe_messages, Conversation, Message, MessageType};
pub use unread::{AgentUnreadTree, ClientUnreadCounts, PropertyUnreadCounts};
