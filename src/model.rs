//! Core data model.
//!
//! Everything persisted is a secured entity: a JSON document with `_id`,
//! `_type`, an ordered `_acl` and audit stamps. The typed structs here are
//! views over those documents; the store works on raw `serde_json::Value`.

pub mod acl;
pub mod identity;
pub mod queue;
pub mod time;
pub mod workitem;

pub use acl::{Ace, Right, Rights};
pub use identity::{Identity, RoleRef};
pub use queue::WorkitemQueue;
pub use workitem::{State, Workitem, WorkitemFile};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Ids
// ---------------------------------------------------------------------------

/// Generate a fresh entity id: 24 lowercase hex characters.
pub fn new_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(24);
    id
}

/// Does `value` look like a system-generated id?
pub fn looks_like_id(value: &str) -> bool {
    value.len() == 24 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

// ---------------------------------------------------------------------------
// Well-known principals and collections
// ---------------------------------------------------------------------------

pub mod wellknown {
    pub const ROOT_ID: &str = "59f1f6e6f0a22200126638d8";
    pub const ROOT_NAME: &str = "root";
    pub const ADMINS_ID: &str = "5a1702fa245d9013697656fb";
    pub const ADMINS_NAME: &str = "admins";
    pub const GUEST_ID: &str = "65cb30c40ff51e174095573c";
    pub const GUEST_NAME: &str = "guest";
    pub const WORKITEM_QUEUE_ADMINS_ID: &str = "625440c4231309af5f2052cd";
    pub const WORKITEM_QUEUE_ADMINS_NAME: &str = "workitem queue admins";

    /// Reserved management channel name, never bindable by clients.
    pub const MANAGEMENT_CHANNEL: &str = "openflow";
}

pub mod collections {
    /// Users and roles.
    pub const USERS: &str = "users";
    /// Workitem queues plus broker queue/exchange backing entities.
    pub const MQ: &str = "mq";
    pub const WORKITEMS: &str = "workitems";
    pub const AUDIT: &str = "audit";
}

pub mod types {
    pub const WORKITEM: &str = "workitem";
    pub const WORKITEM_QUEUE: &str = "workitemqueue";
    pub const ROLE: &str = "role";
    pub const USER: &str = "user";
    pub const QUEUE: &str = "queue";
    pub const EXCHANGE: &str = "exchange";
}

// ---------------------------------------------------------------------------
// Audit stamps
// ---------------------------------------------------------------------------

/// Creation and modification stamps carried by every entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Audit {
    #[serde(rename = "_created", default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(rename = "_createdby", default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(rename = "_createdbyid", default, skip_serializing_if = "Option::is_none")]
    pub created_by_id: Option<String>,
    #[serde(rename = "_modified", default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(rename = "_modifiedby", default, skip_serializing_if = "Option::is_none")]
    pub modified_by: Option<String>,
    #[serde(rename = "_modifiedbyid", default, skip_serializing_if = "Option::is_none")]
    pub modified_by_id: Option<String>,
}

impl Audit {
    /// Fresh stamps attributing creation to `identity`.
    pub fn created_by(identity: &Identity) -> Self {
        let now = Utc::now();
        Self {
            created: Some(now),
            created_by: Some(identity.name.clone()),
            created_by_id: Some(identity.id.clone()),
            modified: Some(now),
            modified_by: Some(identity.name.clone()),
            modified_by_id: Some(identity.id.clone()),
        }
    }

    pub fn touch(&mut self, identity: &Identity) {
        self.modified = Some(Utc::now());
        self.modified_by = Some(identity.name.clone());
        self.modified_by_id = Some(identity.id.clone());
    }
}

/// Serialize a typed entity into the document form the store persists.
pub fn to_document<T: Serialize>(entity: &T) -> crate::error::Result<serde_json::Value> {
    Ok(serde_json::to_value(entity)?)
}

/// Parse a stored document back into its typed view.
pub fn from_document<T: serde::de::DeserializeOwned>(
    doc: serde_json::Value,
) -> crate::error::Result<T> {
    Ok(serde_json::from_value(doc)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_ids_look_like_ids() {
        let id = new_id();
        assert_eq!(id.len(), 24);
        assert!(looks_like_id(&id));
        assert_ne!(id, new_id());
    }

    #[test]
    fn names_do_not_look_like_ids() {
        assert!(!looks_like_id("invoices"));
        assert!(!looks_like_id("zzzzzzzzzzzzzzzzzzzzzzzz"));
        assert!(looks_like_id(wellknown::ROOT_ID));
    }
}
