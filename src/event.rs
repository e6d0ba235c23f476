//! Audit events recorded for destructive or cross-queue operations.
//!
//! Events are written to the `audit` collection by the system identity and
//! mirrored to the log. Failing to record one never fails the operation
//! that produced it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Ace, Identity, Rights, collections, wellknown};
use crate::store::DocumentStore;

/// A structured audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    #[serde(rename = "_type")]
    pub entity_type: String,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    pub userid: String,
    pub username: String,
    /// What happened.
    #[serde(flatten)]
    pub kind: AuditKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AuditKind {
    QueuePurged {
        wiqid: String,
        wiq: String,
        workitems: u64,
        files: u64,
    },
    QueueDeleted {
        wiqid: String,
        wiq: String,
    },
    WorkitemDeleted {
        id: String,
        wiqid: String,
    },
    WorkitemRouted {
        source_id: String,
        target_id: String,
        target_wiqid: String,
    },
}

#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn DocumentStore>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, actor: &Identity, kind: AuditKind) {
        tracing::info!(user = %actor.username, event = ?kind, "audit");
        let event = AuditEvent {
            entity_type: "audit".to_string(),
            timestamp: Utc::now(),
            userid: actor.id.clone(),
            username: actor.username.clone(),
            kind,
        };

        let mut doc = match serde_json::to_value(&event) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode audit event");
                return;
            }
        };
        if let Some(obj) = doc.as_object_mut() {
            let acl = vec![Ace::allow(wellknown::ADMINS_ID, wellknown::ADMINS_NAME, Rights::FULL_CONTROL)];
            if let Ok(acl) = serde_json::to_value(acl) {
                obj.insert("_acl".into(), acl);
            }
        }
        if let Err(e) = self
            .store
            .insert_one(collections::AUDIT, doc, &Identity::root())
            .await
        {
            tracing::warn!(error = %e, "failed to record audit event");
        }
    }
}
