//! Route-on-completion: duplicate a finished item into its target queue.

use chrono::{Duration, Utc};

use super::WorkitemEngine;
use crate::error::Result;
use crate::event::AuditKind;
use crate::model::acl::add_right;
use crate::model::workitem::Routing;
use crate::model::{self, Identity, State, Workitem, WorkitemQueue, collections};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

impl WorkitemEngine {
    /// Duplicate `item` into the routing target for its (terminal) state, if
    /// one is configured. Item-level targets win over the queue's.
    pub(crate) async fn route_completed(
        &self,
        identity: &Identity,
        item: &Workitem,
        queue: &WorkitemQueue,
    ) -> Result<Option<Workitem>> {
        let (id, name) = match item.routing.target_for(item.state) {
            (None, None) => queue.routing.target_for(item.state),
            target => target,
        };
        if id.is_none() && name.is_none() {
            return Ok(None);
        }

        let target = self.resolve_queue(identity, id, name).await?;
        let duplicate = self.duplicate_to(identity, item, &target).await?;
        Ok(Some(duplicate))
    }

    /// Create a fresh copy of `source` in `target`. The copy owns its own
    /// blobs and starts over with no retries, errors or claimant.
    pub(crate) async fn duplicate_to(
        &self,
        identity: &Identity,
        source: &Workitem,
        target: &WorkitemQueue,
    ) -> Result<Workitem> {
        let mut item = source.clone();
        item.id = model::new_id();
        item.wiq = target.name.clone();
        item.wiqid = target.id.clone();
        item.state = State::New;
        item.retries = 0;
        item.nextrun = Some(Utc::now() + Duration::seconds(target.initialdelay as i64));
        item.lastrun = None;
        item.userid = None;
        item.username = None;
        item.errormessage = None;
        item.errortype = None;
        item.errorsource = None;
        item.routing = Routing::default();
        item.audit = model::Audit::created_by(identity);
        for ace in target.acl.iter().filter(|ace| !ace.deny) {
            add_right(&mut item.acl, &ace.id, &ace.name, ace.rights);
        }

        let mut files = Vec::with_capacity(source.files.len());
        for file in &source.files {
            match self.copy_file(file, &item.id, target, identity).await {
                Ok(copy) => files.push(copy),
                Err(e) => {
                    tracing::error!(workitem = %source.id, blob = %file.id, error = %e, "failed to copy workitem file");
                }
            }
        }
        item.files = files;

        let doc = model::to_document(&item)?;
        self.store
            .insert_one(collections::WORKITEMS, doc, &Identity::root())
            .await?;

        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", target.name.clone()),
                KeyValue::new("operation", "route"),
            ],
        );
        tracing::info!(source = %source.id, workitem = %item.id, wiq = %target.name, "routed workitem");
        self.audit
            .record(
                identity,
                AuditKind::WorkitemRouted {
                    source_id: source.id.clone(),
                    target_id: item.id.clone(),
                    target_wiqid: target.id.clone(),
                },
            )
            .await;
        if item.nextrun.is_some_and(|at| at <= Utc::now()) {
            self.monitor.notify(&target.id);
        }
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use crate::model::{State, collections};
    use crate::store::{DocumentStore, Filter, Query};
    use crate::workitem::testing::{harness, queue, user};
    use crate::workitem::{
        AddWorkitemRequest, NewWorkitem, PopWorkitemRequest, UpdateWorkitemRequest,
    };
    use crate::model::workitem::NewFile;
    use base64::Engine as _;

    #[tokio::test]
    async fn successful_item_is_duplicated_once() {
        let h = harness();
        queue(&h, "Q1").await;
        let target = queue(&h, "Q2").await;

        let added = h
            .engine
            .add_workitem(
                &user(),
                AddWorkitemRequest::to_queue(
                    "Q1",
                    NewWorkitem::new("job1").file(NewFile {
                        filename: "in.txt".into(),
                        file: Some(base64::engine::general_purpose::STANDARD.encode("data")),
                        compressed: false,
                    }),
                )
                .success_wiq("Q2"),
            )
            .await
            .unwrap();
        h.engine
            .pop_workitem(&user(), PopWorkitemRequest::from_queue("Q1"))
            .await
            .unwrap()
            .unwrap();
        h.engine
            .update_workitem(
                &user(),
                UpdateWorkitemRequest::new(&added.id)
                    .error("partial", Some("application"))
                    .state("successful"),
            )
            .await
            .unwrap();

        let copies = h
            .store
            .query(
                collections::WORKITEMS,
                &Query::new(Filter::eq("wiqid", target.id.as_str())),
                &user(),
            )
            .await
            .unwrap();
        assert_eq!(copies.len(), 1);
        let copy: crate::model::Workitem = crate::model::from_document(copies[0].clone()).unwrap();
        assert_ne!(copy.id, added.id);
        assert_eq!(copy.state, State::New);
        assert_eq!(copy.retries, 0);
        assert!(copy.errormessage.is_none());
        assert!(copy.routing.is_empty());
        assert!(copy.userid.is_none());
        assert_eq!(copy.files.len(), 1);
        assert_ne!(copy.files[0].id, added.files[0].id);
        assert_eq!(h.blobs.len().await, 2);
    }

    #[tokio::test]
    async fn queue_level_target_applies_to_failures() {
        let h = harness();
        let mut source = queue(&h, "work").await;
        let errors = queue(&h, "errors").await;
        source.routing.failed_wiqid = Some(errors.id.clone());
        h.store
            .update_one(
                collections::MQ,
                &Filter::id(&source.id),
                crate::model::to_document(&source).unwrap(),
                &crate::model::Identity::root(),
            )
            .await
            .unwrap();

        let added = h
            .engine
            .add_workitem(&user(), AddWorkitemRequest::to_queue("work", NewWorkitem::new("x")))
            .await
            .unwrap();
        h.engine
            .update_workitem(&user(), UpdateWorkitemRequest::new(&added.id).state("failed"))
            .await
            .unwrap();

        let count = h
            .store
            .count(collections::WORKITEMS, &Filter::eq("wiqid", errors.id.as_str()), &user())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn no_target_means_no_copy() {
        let h = harness();
        queue(&h, "plain").await;
        let added = h
            .engine
            .add_workitem(&user(), AddWorkitemRequest::to_queue("plain", NewWorkitem::new("x")))
            .await
            .unwrap();
        h.engine
            .update_workitem(&user(), UpdateWorkitemRequest::new(&added.id).state("successful"))
            .await
            .unwrap();
        assert_eq!(h.store.len(collections::WORKITEMS).await, 1);
    }
}
