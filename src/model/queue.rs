//! Workitem queues.

use serde::{Deserialize, Serialize};

use super::workitem::Routing;
use super::{Ace, Audit, types};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkitemQueue {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_type", default = "queue_type")]
    pub entity_type: String,
    pub name: String,
    pub maxretries: u32,
    /// Seconds before a retried item becomes claimable again.
    pub retrydelay: u64,
    /// Seconds before a fresh item becomes claimable.
    pub initialdelay: u64,
    #[serde(flatten)]
    pub routing: Routing,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflowid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robotqueue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amqpqueue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projectid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packageid: Option<String>,
    /// Auto-generated scoping role, removed together with the queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usersrole: Option<String>,
    /// Template ACL copied onto every new item.
    #[serde(rename = "_acl", default)]
    pub acl: Vec<Ace>,
    #[serde(flatten)]
    pub audit: Audit,
}

fn queue_type() -> String {
    types::WORKITEM_QUEUE.to_string()
}

pub const DEFAULT_MAX_RETRIES: u32 = 3;
