//! DeleteWorkitem: remove an item and every blob it owns.

use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};

use super::WorkitemEngine;
use crate::auth::AuthorizationGate;
use crate::error::{Error, Result};
use crate::event::AuditKind;
use crate::model::{Identity, Right, collections};
use crate::telemetry::metrics;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteWorkitemRequest {
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
}

impl DeleteWorkitemRequest {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: Some(id.into()) }
    }
}

impl WorkitemEngine {
    pub async fn delete_workitem(&self, identity: &Identity, req: DeleteWorkitemRequest) -> Result<()> {
        let id = req
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::mandatory("_id"))?;

        let item = self.load_workitem(identity, &id).await?;
        AuthorizationGate::require(identity, &item.acl, Right::Invoke, "work item")?;
        AuthorizationGate::require(identity, &item.acl, Right::Delete, "work item")?;

        let files = self.delete_item_blobs(&item.id, &item.files).await;
        if !self
            .store
            .delete_one(collections::WORKITEMS, &item.id, &Identity::root())
            .await?
        {
            return Err(Error::NotFound(format!("Work item with _id {id} not found.")));
        }

        tracing::info!(workitem = %item.id, wiq = %item.wiq, files, user = %identity.username, "workitem deleted");
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", item.wiq.clone()),
                KeyValue::new("operation", "delete"),
            ],
        );
        self.audit
            .record(
                identity,
                AuditKind::WorkitemDeleted {
                    id: item.id.clone(),
                    wiqid: item.wiqid.clone(),
                },
            )
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::workitem::NewFile;
    use crate::model::{Ace, Rights};
    use crate::store::{DocumentStore, Filter};
    use crate::workitem::testing::{harness, queue, user};
    use crate::workitem::{AddWorkitemRequest, NewWorkitem};
    use base64::Engine as _;

    #[tokio::test]
    async fn delete_cascades_to_blobs() {
        let h = harness();
        queue(&h, "cascade").await;
        let item = h
            .engine
            .add_workitem(
                &user(),
                AddWorkitemRequest::to_queue(
                    "cascade",
                    NewWorkitem::new("x").file(NewFile {
                        filename: "a/b.txt".into(),
                        file: Some(base64::engine::general_purpose::STANDARD.encode("abc")),
                        compressed: false,
                    }),
                ),
            )
            .await
            .unwrap();
        assert_eq!(h.blobs.len().await, 1);

        h.engine
            .delete_workitem(&user(), DeleteWorkitemRequest::new(&item.id))
            .await
            .unwrap();
        assert_eq!(h.blobs.len().await, 0);
        assert_eq!(h.store.len(collections::WORKITEMS).await, 0);
        assert_eq!(h.store.len(collections::AUDIT).await, 1);
    }

    #[tokio::test]
    async fn delete_needs_delete_right() {
        let h = harness();
        queue(&h, "guarded").await;
        let item = h
            .engine
            .add_workitem(&user(), AddWorkitemRequest::to_queue("guarded", NewWorkitem::new("x")))
            .await
            .unwrap();

        // Another user who may read and invoke, but not delete.
        let worker = Identity::new("0123456789abcdef01234567", "Wes", "wes");
        let mut doc = crate::model::to_document(&item).unwrap();
        let mut acl = item.acl.clone();
        acl.push(Ace::allow(&worker.id, &worker.name, Rights::from(Right::Read) | Right::Invoke));
        doc["_acl"] = serde_json::to_value(acl).unwrap();
        h.store
            .update_one(collections::WORKITEMS, &Filter::id(&item.id), doc, &Identity::root())
            .await
            .unwrap();

        let err = h
            .engine
            .delete_workitem(&worker, DeleteWorkitemRequest::new(&item.id))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AccessDenied(_)));
        assert_eq!(h.store.len(collections::WORKITEMS).await, 1);
    }

    #[tokio::test]
    async fn delete_requires_id() {
        let h = harness();
        let err = h
            .engine
            .delete_workitem(&user(), DeleteWorkitemRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "_id is mandatory");
    }
}
