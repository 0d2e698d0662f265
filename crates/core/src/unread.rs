//! The three unread-count views kept in step with message read state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-property badge shown inside a conversation room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyUnreadCounts {
    pub agent_unread_count: u64,
    pub client_unread_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyUnread {
    pub property_id: Uuid,
    pub unread_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientUnread {
    pub client_id: Uuid,
    pub unread_count: u64,
    pub properties: Vec<PropertyUnread>,
}

/// Agent-wide badge tree: every client, every property, and the grand total.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentUnreadTree {
    pub total_unread: u64,
    pub clients: Vec<ClientUnread>,
}

impl AgentUnreadTree {
    /// Build the tree from flat `(client, property, unread)` rows.
    ///
    /// Rows for the same pair are summed; clients and properties come out in
    /// id order so repeated builds serialize identically.
    pub fn from_rows<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = (Uuid, Uuid, u64)>,
    {
        let mut grouped: BTreeMap<Uuid, BTreeMap<Uuid, u64>> = BTreeMap::new();
        for (client_id, property_id, unread) in rows {
            *grouped
                .entry(client_id)
                .or_default()
                .entry(property_id)
                .or_default() += unread;
        }

        let mut total_unread = 0;
        let clients = grouped
            .into_iter()
            .map(|(client_id, properties)| {
                let properties: Vec<PropertyUnread> = properties
                    .into_iter()
                    .map(|(property_id, unread_count)| PropertyUnread {
                        property_id,
                        unread_count,
                    })
                    .collect();
                let unread_count = properties.iter().map(|p| p.unread_count).sum();
                total_unread += unread_count;
                ClientUnread {
                    client_id,
                    unread_count,
                    properties,
                }
            })
            .collect();

        Self {
            total_unread,
            clients,
        }
    }

    pub fn property(&self, client_id: Uuid, property_id: Uuid) -> u64 {
        self.clients
            .iter()
            .find(|c| c.client_id == client_id)
            .and_then(|c| c.properties.iter().find(|p| p.property_id == property_id))
            .map(|p| p.unread_count)
            .unwrap_or(0)
    }
}

/// Client-wide flat map of property id to unread count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientUnreadCounts {
    pub client_id: Uuid,
    pub unread_counts: BTreeMap<Uuid, u64>,
}

impl ClientUnreadCounts {
    pub fn get(&self, property_id: Uuid) -> u64 {
        self.unread_counts.get(&property_id).copied().unwrap_or(0)
    }
}
