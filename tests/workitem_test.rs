//! Workitem queue engine scenarios against the in-memory stores.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flowgate::cache::TtlCache;
use flowgate::error::{Error, Result};
use flowgate::model::workitem::NewFile;
use flowgate::model::{Identity, State, collections};
use flowgate::store::{
    BlobInfo, BlobStore, DocumentStore, Filter, MemoryBlobStore, MemoryDocumentStore, Query,
};
use flowgate::workitem::{
    AddWorkitemQueueRequest, AddWorkitemRequest, AddWorkitemsRequest, DeleteWorkitemQueueRequest,
    NewWorkitem, PopWorkitemRequest, QueueMonitor, UpdateWorkitemRequest, WorkitemEngine,
};
use serde_json::{Value, json};
use tokio::sync::Mutex;

fn engine_over(store: Arc<dyn DocumentStore>) -> WorkitemEngine {
    let monitor = QueueMonitor::new(TtlCache::new(Duration::from_secs(5)));
    WorkitemEngine::new(store, Arc::new(MemoryBlobStore::new()), monitor)
}

fn engine() -> WorkitemEngine {
    engine_over(Arc::new(MemoryDocumentStore::new()))
}

fn ann() -> Identity {
    Identity::new("5f0c1d2e3a4b5c6d7e8f9a0b", "Ann", "ann")
}

async fn pop(engine: &WorkitemEngine, wiq: &str) -> Option<flowgate::model::Workitem> {
    engine
        .pop_workitem(&ann(), PopWorkitemRequest::from_queue(wiq))
        .await
        .unwrap()
}

#[tokio::test]
async fn retries_run_until_the_budget_is_spent() {
    let engine = engine();
    engine
        .add_workitem_queue(&ann(), AddWorkitemQueueRequest::new("invoices", 3, 0, 0))
        .await
        .unwrap();
    let added = engine
        .add_workitem(
            &ann(),
            AddWorkitemRequest::to_queue("invoices", NewWorkitem::new("inv-1").payload(json!({"n": 1}))),
        )
        .await
        .unwrap();
    assert_eq!(added.state, State::New);

    let mut states = Vec::new();
    for _ in 0..3 {
        let claimed = pop(&engine, "invoices").await.expect("item should be due");
        assert_eq!(claimed.id, added.id);
        assert_eq!(claimed.state, State::Processing);
        let updated = engine
            .update_workitem(
                &ann(),
                UpdateWorkitemRequest::new(&added.id)
                    .state("retry")
                    .error("timeout talking to ERP", None),
            )
            .await
            .unwrap();
        states.push((updated.state, updated.retries));
    }

    assert_eq!(
        states,
        vec![(State::New, 1), (State::New, 2), (State::Failed, 2)]
    );
    assert!(pop(&engine, "invoices").await.is_none());
}

#[tokio::test]
async fn business_errors_fail_immediately() {
    let engine = engine();
    engine
        .add_workitem_queue(&ann(), AddWorkitemQueueRequest::new("orders", 5, 0, 0))
        .await
        .unwrap();
    let item = engine
        .add_workitem(&ann(), AddWorkitemRequest::to_queue("orders", NewWorkitem::new("o-1")))
        .await
        .unwrap();
    pop(&engine, "orders").await.unwrap();

    let updated = engine
        .update_workitem(
            &ann(),
            UpdateWorkitemRequest::new(&item.id)
                .state("retry")
                .error("customer does not exist", Some("business")),
        )
        .await
        .unwrap();
    assert_eq!(updated.state, State::Failed);
    assert_eq!(updated.retries, 0);
    assert_eq!(updated.errortype.as_deref(), Some("business"));
}

#[tokio::test]
async fn completed_items_are_routed_to_the_success_queue() {
    let engine = engine();
    engine
        .add_workitem_queue(&ann(), AddWorkitemQueueRequest::new("archive", 3, 0, 0))
        .await
        .unwrap();
    engine
        .add_workitem_queue(
            &ann(),
            AddWorkitemQueueRequest::new("intake", 3, 0, 0).success_wiq("archive"),
        )
        .await
        .unwrap();

    let item = engine
        .add_workitem(
            &ann(),
            AddWorkitemRequest::to_queue("intake", NewWorkitem::new("doc").payload(json!({"pages": 4}))),
        )
        .await
        .unwrap();
    pop(&engine, "intake").await.unwrap();
    engine
        .update_workitem(&ann(), UpdateWorkitemRequest::new(&item.id).state("successful"))
        .await
        .unwrap();

    let routed = pop(&engine, "archive").await.expect("duplicate should be queued");
    assert_ne!(routed.id, item.id);
    assert_eq!(routed.payload, json!({"pages": 4}));
    assert_eq!(routed.retries, 0);
    assert_eq!(routed.wiq, "archive");
    assert!(pop(&engine, "intake").await.is_none());
}

#[tokio::test]
async fn concurrent_pollers_never_claim_the_same_item() {
    let engine = Arc::new(engine());
    engine
        .add_workitem_queue(&ann(), AddWorkitemQueueRequest::new("jobs", 3, 0, 0))
        .await
        .unwrap();
    let items = (0..40).map(|i| NewWorkitem::new(format!("job-{i}"))).collect();
    engine
        .add_workitems(
            &ann(),
            AddWorkitemsRequest {
                wiq: Some("jobs".into()),
                items,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let mut pollers = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        pollers.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(item) = pop(&engine, "jobs").await {
                claimed.push(item.id);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for poller in pollers {
        all.extend(poller.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().collect();
    assert_eq!(all.len(), 40);
    assert_eq!(unique.len(), 40);
}

#[tokio::test]
async fn deleting_a_non_empty_queue_requires_purge() {
    let engine = engine();
    engine
        .add_workitem_queue(&ann(), AddWorkitemQueueRequest::new("batch", 3, 0, 0))
        .await
        .unwrap();
    engine
        .add_workitem(&ann(), AddWorkitemRequest::to_queue("batch", NewWorkitem::new("b-1")))
        .await
        .unwrap();

    let err = engine
        .delete_workitem_queue(&ann(), DeleteWorkitemQueueRequest::named("batch"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotEmpty(_)));

    engine
        .delete_workitem_queue(&ann(), DeleteWorkitemQueueRequest::named("batch").purge())
        .await
        .unwrap();
    let err = engine
        .add_workitem(&ann(), AddWorkitemRequest::to_queue("batch", NewWorkitem::new("b-2")))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

/// Store that lets one workitem slip in right after a bulk delete, the way a
/// concurrent AddWorkitem would.
struct RacingStore {
    inner: MemoryDocumentStore,
    straggler: Mutex<Option<Value>>,
}

#[async_trait]
impl DocumentStore for RacingStore {
    async fn query(&self, collection: &str, query: &Query, identity: &Identity) -> Result<Vec<Value>> {
        self.inner.query(collection, query, identity).await
    }

    async fn count(&self, collection: &str, filter: &Filter, identity: &Identity) -> Result<u64> {
        self.inner.count(collection, filter, identity).await
    }

    async fn insert_one(&self, collection: &str, doc: Value, identity: &Identity) -> Result<Value> {
        self.inner.insert_one(collection, doc, identity).await
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Value>, identity: &Identity) -> Result<Vec<Value>> {
        self.inner.insert_many(collection, docs, identity).await
    }

    async fn update_one(&self, collection: &str, matching: &Filter, doc: Value, identity: &Identity) -> Result<u64> {
        self.inner.update_one(collection, matching, doc, identity).await
    }

    async fn delete_one(&self, collection: &str, id: &str, identity: &Identity) -> Result<bool> {
        self.inner.delete_one(collection, id, identity).await
    }

    async fn delete_many(&self, collection: &str, filter: &Filter, identity: &Identity) -> Result<u64> {
        let deleted = self.inner.delete_many(collection, filter, identity).await?;
        if collection == collections::WORKITEMS {
            if let Some(doc) = self.straggler.lock().await.take() {
                self.inner.insert_one(collection, doc, &Identity::root()).await?;
            }
        }
        Ok(deleted)
    }
}

#[tokio::test]
async fn purge_reports_items_that_raced_in() {
    let store = Arc::new(RacingStore {
        inner: MemoryDocumentStore::new(),
        straggler: Mutex::new(None),
    });
    let engine = engine_over(store.clone());
    let queue = engine
        .add_workitem_queue(&ann(), AddWorkitemQueueRequest::new("racy", 3, 0, 0))
        .await
        .unwrap();
    engine
        .add_workitem(&ann(), AddWorkitemRequest::to_queue("racy", NewWorkitem::new("r-1")))
        .await
        .unwrap();
    *store.straggler.lock().await = Some(json!({
        "_type": "workitem",
        "name": "late",
        "wiq": "racy",
        "wiqid": queue.id,
        "state": "new",
    }));

    let err = engine
        .delete_workitem_queue(&ann(), DeleteWorkitemQueueRequest::named("racy").purge())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PurgeFailed(ref name) if name == "racy"));
    assert_eq!(err.to_string(), "Failed purging workitemqueue racy");

    // The queue itself survives a failed purge.
    let still_there = store
        .query(collections::MQ, &Query::new(Filter::id(&queue.id)), &Identity::root())
        .await
        .unwrap();
    assert_eq!(still_there.len(), 1);
}

/// Blob store whose reads always fail.
struct UnreadableBlobs {
    inner: MemoryBlobStore,
}

#[async_trait]
impl BlobStore for UnreadableBlobs {
    async fn save(&self, bytes: Vec<u8>, filename: &str, content_type: &str, metadata: Value) -> Result<String> {
        self.inner.save(bytes, filename, content_type, metadata).await
    }

    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>> {
        Err(Error::Other(format!("blob {id} unavailable")))
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.inner.delete(id).await
    }

    async fn find(&self, filter: &Filter) -> Result<Vec<BlobInfo>> {
        self.inner.find(filter).await
    }
}

#[tokio::test]
async fn unreadable_files_do_not_strand_a_claimed_item() {
    let monitor = QueueMonitor::new(TtlCache::new(Duration::from_secs(5)));
    let blobs = Arc::new(UnreadableBlobs {
        inner: MemoryBlobStore::new(),
    });
    let engine = WorkitemEngine::new(Arc::new(MemoryDocumentStore::new()), blobs, monitor);
    engine
        .add_workitem_queue(&ann(), AddWorkitemQueueRequest::new("docs", 3, 0, 0))
        .await
        .unwrap();
    let added = engine
        .add_workitem(
            &ann(),
            AddWorkitemRequest::to_queue(
                "docs",
                NewWorkitem::new("with-file").file(NewFile {
                    filename: "report.txt".into(),
                    file: Some("aGVsbG8=".into()),
                    compressed: false,
                }),
            ),
        )
        .await
        .unwrap();

    let mut req = PopWorkitemRequest::from_queue("docs");
    req.includefiles = true;
    let popped = engine.pop_workitem(&ann(), req).await.unwrap().unwrap();
    assert_eq!(popped.id, added.id);
    assert_eq!(popped.state, State::Processing);
    assert_eq!(popped.files.len(), 1);
    assert!(popped.files[0].file.is_none());
}

#[tokio::test]
async fn new_priority_field_wins_over_legacy_one() {
    let engine = engine();
    engine
        .add_workitem_queue(&ann(), AddWorkitemQueueRequest::new("prio", 3, 0, 0))
        .await
        .unwrap();
    let mut item = NewWorkitem::new("p").priority(1);
    item.wipriority = Some(9);
    let added = engine
        .add_workitem(&ann(), AddWorkitemRequest::to_queue("prio", item))
        .await
        .unwrap();
    assert_eq!(added.priority, 1);

    let mut update = UpdateWorkitemRequest::new(&added.id);
    update.priority = Some(4);
    update.wipriority = Some(7);
    let updated = engine.update_workitem(&ann(), update).await.unwrap();
    assert_eq!(updated.priority, 4);
}
