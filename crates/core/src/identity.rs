use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Prefix used for client identities derived from a shared timeline link.
pub const SYNTHETIC_CLIENT_PREFIX: &str = "client_";
/// Prefix used for time-based anonymous identities.
pub const ANONYMOUS_PREFIX: &str = "anonymous_";
/// Identity handed to agents whose credential could not be verified.
pub const FALLBACK_AGENT_ID: &str = "agent_fallback";
/// Prefix for identities substituted when resolution produced garbage.
pub const EMERGENCY_PREFIX: &str = "emergency_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Agent,
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Agent => "agent",
            Role::Client => "client",
        }
    }

    /// The role on the other side of a conversation.
    pub fn counterpart(&self) -> Role {
        match self {
            Role::Agent => Role::Client,
            Role::Client => Role::Agent,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported role '{0}'")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "agent" => Ok(Role::Agent),
            "client" => Ok(Role::Client),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// How a verified identity was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifiedSource {
    /// A signed session token checked by the credential verifier.
    SessionToken,
    /// A timeline link that resolved to a durable client record.
    TimelineLink,
}

/// What a synthetic identity was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum SyntheticSource {
    /// Client connection carrying a timeline identifier with no durable client.
    Timeline(String),
    /// Agent connection whose credential failed verification.
    AgentFallback,
    /// Substituted by the lifecycle manager after resolution misbehaved.
    Emergency(Uuid),
}

/// Resolved identity of a socket connection.
///
/// Downstream authorization must match on the variant; a synthetic or
/// anonymous identity never stands in for a verified account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Verified {
        subject: String,
        source: VerifiedSource,
    },
    Synthetic {
        user_id: String,
        derived_from: SyntheticSource,
    },
    Anonymous {
        user_id: String,
        issued_at_ms: i64,
    },
}

impl Identity {
    pub fn verified(subject: impl Into<String>, source: VerifiedSource) -> Self {
        Identity::Verified {
            subject: subject.into(),
            source,
        }
    }

    /// Deterministic identity for a client that arrived through a timeline link.
    pub fn synthetic_client(timeline_id: impl Into<String>) -> Self {
        let timeline_id = timeline_id.into();
        Identity::Synthetic {
            user_id: format!("{SYNTHETIC_CLIENT_PREFIX}{timeline_id}"),
            derived_from: SyntheticSource::Timeline(timeline_id),
        }
    }

    pub fn agent_fallback() -> Self {
        Identity::Synthetic {
            user_id: FALLBACK_AGENT_ID.to_string(),
            derived_from: SyntheticSource::AgentFallback,
        }
    }

    pub fn emergency(connection_id: Uuid) -> Self {
        Identity::Synthetic {
            user_id: format!("{EMERGENCY_PREFIX}{connection_id}"),
            derived_from: SyntheticSource::Emergency(connection_id),
        }
    }

    /// Time-based identity; `nonce` keeps same-millisecond connections apart.
    pub fn anonymous(issued_at_ms: i64, nonce: Uuid) -> Self {
        Identity::Anonymous {
            user_id: format!("{ANONYMOUS_PREFIX}{issued_at_ms}_{}", nonce.simple()),
            issued_at_ms,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            Identity::Verified { subject, .. } => subject,
            Identity::Synthetic { user_id, .. } => user_id,
            Identity::Anonymous { user_id, .. } => user_id,
        }
    }

    /// Durable account id, only available for verified identities.
    pub fn account_id(&self) -> Option<Uuid> {
        match self {
            Identity::Verified { subject, .. } => Uuid::parse_str(subject).ok(),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Identity::Verified { .. } => "verified",
            Identity::Synthetic { .. } => "synthetic",
            Identity::Anonymous { .. } => "anonymous",
        }
    }

    pub fn is_verified(&self) -> bool {
        matches!(self, Identity::Verified { .. })
    }
}

/// Membership key combining a user id with the role it connected as.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserKey(String);

impl UserKey {
    pub fn new(user_id: &str, role: Role) -> Self {
        Self(format!("{user_id}:{role}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
