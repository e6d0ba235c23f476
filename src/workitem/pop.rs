//! PopWorkitem: the claim loop.
//!
//! Claiming is a conditional replace that only matches while the item still
//! has the state and claimant that were observed. Losing that race matches
//! zero rows and the loop simply looks again; no lock is ever taken.

use chrono::Utc;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};

use super::WorkitemEngine;
use crate::auth::AuthorizationGate;
use crate::error::{Error, Result};
use crate::model::{self, Identity, Right, State, Workitem, collections, types};
use crate::store::{Filter, Query, Sort, SortKind};
use crate::telemetry::{metrics, spans};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PopWorkitemRequest {
    #[serde(default)]
    pub wiq: Option<String>,
    #[serde(default)]
    pub wiqid: Option<String>,
    /// Return file contents with the claimed item.
    #[serde(default)]
    pub includefiles: bool,
}

impl PopWorkitemRequest {
    pub fn from_queue(wiq: impl Into<String>) -> Self {
        Self {
            wiq: Some(wiq.into()),
            ..Default::default()
        }
    }
}

/// Filter matching an item only while it is still in the observed state.
fn unchanged_since(observed: &Workitem) -> Filter {
    let claimant = |path: &str, value: &Option<String>| match value {
        Some(v) => Filter::eq(path, v.as_str()),
        None => Filter::missing(path),
    };
    Filter::id(&observed.id)
        .and(Filter::eq("state", observed.state.as_str()))
        .and(claimant("userid", &observed.userid))
        .and(claimant("username", &observed.username))
}

impl WorkitemEngine {
    pub async fn pop_workitem(
        &self,
        identity: &Identity,
        req: PopWorkitemRequest,
    ) -> Result<Option<Workitem>> {
        let queue = self
            .resolve_queue(identity, req.wiqid.as_deref(), req.wiq.as_deref())
            .await?;

        let claimed = loop {
            let now = Utc::now();
            let query = Query::new(
                Filter::eq("_type", types::WORKITEM)
                    .and(Filter::eq("wiqid", queue.id.as_str()))
                    .and(Filter::eq("state", State::New.as_str()))
                    .and(Filter::lte("nextrun", now)),
            )
            .sort(Sort::asc("priority", SortKind::Number))
            .sort(Sort::asc("nextrun", SortKind::Time))
            .top(1);

            let Some(doc) = self
                .store
                .query(collections::WORKITEMS, &query, identity)
                .await?
                .into_iter()
                .next()
            else {
                break None;
            };
            let observed: Workitem = model::from_document(doc)?;
            if !AuthorizationGate::has_right(identity, &observed.acl, Right::Invoke) {
                return Err(Error::AccessDenied(format!(
                    "Access denied popping workitem {} {} is missing invoke rights",
                    observed.id, identity.username
                )));
            }

            let mut item = observed.clone();
            item.state = State::Processing;
            item.userid = Some(identity.id.clone());
            item.username = Some(identity.name.clone());
            item.lastrun = Some(now);
            item.nextrun = None;
            item.payload = model::workitem::normalize_payload(Some(item.payload));
            item.audit.touch(identity);

            let updated = self
                .store
                .update_one(
                    collections::WORKITEMS,
                    &unchanged_since(&observed),
                    model::to_document(&item)?,
                    &Identity::root(),
                )
                .await?;
            if updated == 1 {
                break Some(item);
            }

            tracing::debug!(workitem = %observed.id, wiq = %queue.name, "lost claim race, retrying");
            metrics::claim_conflicts().add(1, &[KeyValue::new("queue", queue.name.clone())]);
        };

        let Some(mut item) = claimed else {
            return Ok(None);
        };
        spans::record_state_transition(&item.id, State::New.as_str(), State::Processing.as_str());
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", queue.name.clone()),
                KeyValue::new("operation", "pop"),
            ],
        );

        if req.includefiles {
            self.load_file_contents(&mut item.files).await;
        }
        Ok(Some(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workitem::testing::{harness, queue, user};
    use crate::workitem::{AddWorkitemRequest, NewWorkitem};
    use chrono::Duration;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[tokio::test]
    async fn pop_claims_and_stamps() {
        let h = harness();
        queue(&h, "claims").await;
        let added = h
            .engine
            .add_workitem(&user(), AddWorkitemRequest::to_queue("claims", NewWorkitem::new("job1")))
            .await
            .unwrap();

        let popped = h
            .engine
            .pop_workitem(&user(), PopWorkitemRequest::from_queue("claims"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped.id, added.id);
        assert_eq!(popped.state, State::Processing);
        assert_eq!(popped.userid.as_deref(), Some(user().id.as_str()));
        assert!(popped.lastrun.is_some());
        assert!(popped.nextrun.is_none());

        let again = h
            .engine
            .pop_workitem(&user(), PopWorkitemRequest::from_queue("claims"))
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn lower_priority_number_is_served_first() {
        let h = harness();
        queue(&h, "prio").await;
        for (name, priority) in [("low", 5), ("urgent", 0), ("normal", 2)] {
            h.engine
                .add_workitem(
                    &user(),
                    AddWorkitemRequest::to_queue("prio", NewWorkitem::new(name).priority(priority)),
                )
                .await
                .unwrap();
        }
        let mut order = Vec::new();
        while let Some(item) = h
            .engine
            .pop_workitem(&user(), PopWorkitemRequest::from_queue("prio"))
            .await
            .unwrap()
        {
            order.push(item.name);
        }
        assert_eq!(order, vec!["urgent", "normal", "low"]);
    }

    #[tokio::test]
    async fn items_not_yet_due_are_skipped() {
        let h = harness();
        queue(&h, "future").await;
        h.engine
            .add_workitem(
                &user(),
                AddWorkitemRequest::to_queue(
                    "future",
                    NewWorkitem::new("later").nextrun(Utc::now() + Duration::minutes(5)),
                ),
            )
            .await
            .unwrap();
        let popped = h
            .engine
            .pop_workitem(&user(), PopWorkitemRequest::from_queue("future"))
            .await
            .unwrap();
        assert!(popped.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_pollers_never_share_an_item() {
        let h = harness();
        queue(&h, "race").await;
        for i in 0..20 {
            h.engine
                .add_workitem(&user(), AddWorkitemRequest::to_queue("race", NewWorkitem::new(format!("job{i}"))))
                .await
                .unwrap();
        }

        let engine = Arc::new(h.engine);
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let engine = engine.clone();
            tasks.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Some(item) = engine
                    .pop_workitem(&user(), PopWorkitemRequest::from_queue("race"))
                    .await
                    .unwrap()
                {
                    mine.push(item.id);
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for task in tasks {
            for id in task.await.unwrap() {
                total += 1;
                assert!(seen.insert(id), "item claimed twice");
            }
        }
        assert_eq!(total, 20);
    }

    #[tokio::test]
    async fn includefiles_returns_contents() {
        use base64::Engine as _;
        let h = harness();
        queue(&h, "withfiles").await;
        let encoded = base64::engine::general_purpose::STANDARD.encode("payload");
        h.engine
            .add_workitem(
                &user(),
                AddWorkitemRequest::to_queue(
                    "withfiles",
                    NewWorkitem::new("f").file(crate::model::workitem::NewFile {
                        filename: "a.txt".into(),
                        file: Some(encoded.clone()),
                        compressed: false,
                    }),
                ),
            )
            .await
            .unwrap();
        let popped = h
            .engine
            .pop_workitem(
                &user(),
                PopWorkitemRequest {
                    wiq: Some("withfiles".into()),
                    includefiles: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped.files[0].file.as_deref(), Some(encoded.as_str()));
    }
}
