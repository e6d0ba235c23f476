//! Workitem queue engine.
//!
//! Owns workitems and workitem queues: creation, atomic claiming, retry and
//! terminal transitions, routing on completion and cascading deletion.
//!
//! Reads go through the store with the caller's identity, so they are
//! ACL-filtered. Writes happen with the system identity, but only after the
//! engine has checked the caller's rights on the loaded entity.

pub mod add;
pub mod delete;
pub mod files;
pub mod monitor;
pub mod pop;
pub mod queues;
pub mod routing;
pub mod update;

pub use add::{AddWorkitemRequest, AddWorkitemsRequest, NewWorkitem};
pub use delete::DeleteWorkitemRequest;
pub use monitor::QueueMonitor;
pub use pop::PopWorkitemRequest;
pub use queues::{
    AddWorkitemQueueRequest, DeleteWorkitemQueueRequest, GetWorkitemQueueRequest,
    UpdateWorkitemQueueRequest,
};
pub use update::UpdateWorkitemRequest;

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::event::AuditLog;
use crate::model::{self, Identity, Workitem, WorkitemQueue, collections, types};
use crate::store::{BlobStore, DocumentStore, Filter, Query};

pub struct WorkitemEngine {
    store: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    monitor: QueueMonitor,
    audit: AuditLog,
}

impl WorkitemEngine {
    pub fn new(store: Arc<dyn DocumentStore>, blobs: Arc<dyn BlobStore>, monitor: QueueMonitor) -> Self {
        let audit = AuditLog::new(store.clone());
        Self {
            store,
            blobs,
            monitor,
            audit,
        }
    }

    pub fn monitor(&self) -> &QueueMonitor {
        &self.monitor
    }

    /// Find a workitem queue by id, falling back to name.
    pub(crate) async fn resolve_queue(
        &self,
        identity: &Identity,
        id: Option<&str>,
        name: Option<&str>,
    ) -> Result<WorkitemQueue> {
        let id = id.filter(|s| !s.is_empty());
        let name = name.filter(|s| !s.is_empty());
        if id.is_none() && name.is_none() {
            return Err(Error::mandatory("wiq or wiqid"));
        }

        self.find_queue(identity, id, name).await?.ok_or_else(|| {
            Error::NotFound(format!(
                "Work item queue not found {} ({}) not found.",
                name.unwrap_or_default(),
                id.unwrap_or_default()
            ))
        })
    }

    pub(crate) async fn find_queue(
        &self,
        identity: &Identity,
        id: Option<&str>,
        name: Option<&str>,
    ) -> Result<Option<WorkitemQueue>> {
        let by_type = Filter::eq("_type", types::WORKITEM_QUEUE);
        if let Some(id) = id.filter(|s| !s.is_empty()) {
            let query = Query::new(Filter::id(id).and(by_type.clone())).top(1);
            if let Some(doc) = self.first(collections::MQ, &query, identity).await? {
                return Ok(Some(model::from_document(doc)?));
            }
        }
        if let Some(name) = name.filter(|s| !s.is_empty()) {
            let query = Query::new(Filter::eq("name", name).and(by_type)).top(1);
            if let Some(doc) = self.first(collections::MQ, &query, identity).await? {
                return Ok(Some(model::from_document(doc)?));
            }
        }
        Ok(None)
    }

    pub(crate) async fn load_workitem(&self, identity: &Identity, id: &str) -> Result<Workitem> {
        let query = Query::new(Filter::id(id).and(Filter::eq("_type", types::WORKITEM))).top(1);
        match self.first(collections::WORKITEMS, &query, identity).await? {
            Some(doc) => model::from_document(doc),
            None => Err(Error::NotFound(format!("Work item with _id {id} not found."))),
        }
    }

    async fn first(
        &self,
        collection: &str,
        query: &Query,
        identity: &Identity,
    ) -> Result<Option<serde_json::Value>> {
        Ok(self
            .store
            .query(collection, query, identity)
            .await?
            .into_iter()
            .next())
    }

    /// Replace a stored workitem unconditionally (after the caller's rights
    /// were checked).
    pub(crate) async fn save_workitem(&self, item: &Workitem) -> Result<()> {
        let doc = model::to_document(item)?;
        let updated = self
            .store
            .update_one(collections::WORKITEMS, &Filter::id(&item.id), doc, &Identity::root())
            .await?;
        if updated == 0 {
            return Err(Error::NotFound(format!("Work item with _id {} not found.", item.id)));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::cache::TtlCache;
    use crate::store::{MemoryBlobStore, MemoryDocumentStore};
    use std::time::Duration;

    pub struct Harness {
        pub engine: WorkitemEngine,
        pub store: Arc<MemoryDocumentStore>,
        pub blobs: Arc<MemoryBlobStore>,
    }

    pub fn harness() -> Harness {
        let store = Arc::new(MemoryDocumentStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let monitor = QueueMonitor::new(TtlCache::new(Duration::from_secs(5)));
        Harness {
            engine: WorkitemEngine::new(store.clone(), blobs.clone(), monitor),
            store,
            blobs,
        }
    }

    pub fn user() -> Identity {
        Identity::new("5f0c1d2e3a4b5c6d7e8f9a0b", "Ann", "ann")
    }

    pub async fn queue(harness: &Harness, name: &str) -> WorkitemQueue {
        harness
            .engine
            .add_workitem_queue(&user(), AddWorkitemQueueRequest::new(name, 3, 10, 0))
            .await
            .unwrap()
    }
}
