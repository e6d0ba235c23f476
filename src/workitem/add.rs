//! AddWorkitem / AddWorkitems.

use chrono::{DateTime, Duration, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::WorkitemEngine;
use crate::auth::AuthorizationGate;
use crate::error::{Error, Result};
use crate::model::workitem::{self, NewFile, Routing};
use crate::model::{self, Audit, Identity, Right, State, Workitem, WorkitemQueue, collections, time, types};
use crate::telemetry::metrics;

/// Fields of one workitem to create.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewWorkitem {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub priority: Option<i64>,
    /// Older clients send the item priority under this name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wipriority: Option<i64>,
    #[serde(default, deserialize_with = "time::deserialize_optional")]
    pub nextrun: Option<DateTime<Utc>>,
    #[serde(default)]
    pub files: Vec<NewFile>,
}

impl NewWorkitem {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn nextrun(mut self, at: DateTime<Utc>) -> Self {
        self.nextrun = Some(at);
        self
    }

    pub fn file(mut self, file: NewFile) -> Self {
        self.files.push(file);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddWorkitemRequest {
    #[serde(default)]
    pub wiq: Option<String>,
    #[serde(default)]
    pub wiqid: Option<String>,
    #[serde(flatten)]
    pub item: NewWorkitem,
    #[serde(flatten)]
    pub routing: Routing,
}

impl AddWorkitemRequest {
    /// Add `item` to the queue named `wiq`.
    pub fn to_queue(wiq: impl Into<String>, item: NewWorkitem) -> Self {
        Self {
            wiq: Some(wiq.into()),
            item,
            ..Default::default()
        }
    }

    pub fn success_wiq(mut self, wiq: impl Into<String>) -> Self {
        self.routing.success_wiq = Some(wiq.into());
        self
    }

    pub fn failed_wiq(mut self, wiq: impl Into<String>) -> Self {
        self.routing.failed_wiq = Some(wiq.into());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddWorkitemsRequest {
    #[serde(default)]
    pub wiq: Option<String>,
    #[serde(default)]
    pub wiqid: Option<String>,
    #[serde(default)]
    pub items: Vec<NewWorkitem>,
    #[serde(flatten)]
    pub routing: Routing,
}

impl WorkitemEngine {
    /// Build an unsaved workitem from a template queue and creation fields.
    pub(crate) fn build_workitem(
        &self,
        queue: &WorkitemQueue,
        new: &NewWorkitem,
        routing: &Routing,
        identity: &Identity,
    ) -> Workitem {
        let now = Utc::now();
        let nextrun = new
            .nextrun
            .unwrap_or_else(|| now + Duration::seconds(queue.initialdelay as i64));
        Workitem {
            id: model::new_id(),
            entity_type: types::WORKITEM.to_string(),
            name: new
                .name
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| workitem::DEFAULT_NAME.to_string()),
            wiq: queue.name.clone(),
            wiqid: queue.id.clone(),
            payload: workitem::normalize_payload(new.payload.clone()),
            priority: new
                .priority
                .or(new.wipriority)
                .unwrap_or_else(workitem::default_priority),
            state: State::New,
            retries: 0,
            nextrun: Some(nextrun),
            lastrun: None,
            userid: None,
            username: None,
            errormessage: None,
            errortype: None,
            errorsource: None,
            files: Vec::new(),
            routing: routing.clone(),
            acl: queue.acl.clone(),
            audit: Audit::created_by(identity),
        }
    }

    pub async fn add_workitem(&self, identity: &Identity, req: AddWorkitemRequest) -> Result<Workitem> {
        let queue = self
            .resolve_queue(identity, req.wiqid.as_deref(), req.wiq.as_deref())
            .await?;

        let mut item = self.build_workitem(&queue, &req.item, &req.routing, identity);
        AuthorizationGate::require(identity, &item.acl, Right::Invoke, "work item queue")?;

        item.files = self
            .store_files(&item.id, &queue, &req.item.files, identity)
            .await;

        let doc = self
            .store
            .insert_one(collections::WORKITEMS, model::to_document(&item)?, &Identity::root())
            .await?;
        let item: Workitem = model::from_document(doc)?;

        tracing::info!(workitem = %item.id, wiq = %queue.name, user = %identity.username, "workitem added");
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", queue.name.clone()),
                KeyValue::new("operation", "add"),
            ],
        );
        if item.nextrun.is_some_and(|at| at <= Utc::now()) {
            self.monitor.notify(&queue.id);
        }
        Ok(item)
    }

    pub async fn add_workitems(
        &self,
        identity: &Identity,
        req: AddWorkitemsRequest,
    ) -> Result<Vec<Workitem>> {
        let queue = self
            .resolve_queue(identity, req.wiqid.as_deref(), req.wiq.as_deref())
            .await?;
        if req.items.is_empty() {
            return Err(Error::mandatory("items"));
        }

        let mut docs = Vec::with_capacity(req.items.len());
        let mut relevant = false;
        let now = Utc::now();
        for new in &req.items {
            let mut item = self.build_workitem(&queue, new, &req.routing, identity);
            AuthorizationGate::require(identity, &item.acl, Right::Invoke, "work item queue")?;
            item.files = self.store_files(&item.id, &queue, &new.files, identity).await;
            relevant |= item.nextrun.is_some_and(|at| at <= now);
            docs.push(model::to_document(&item)?);
        }

        let inserted = self
            .store
            .insert_many(collections::WORKITEMS, docs, &Identity::root())
            .await?;
        let items = inserted
            .into_iter()
            .map(model::from_document)
            .collect::<Result<Vec<Workitem>>>()?;

        tracing::info!(count = items.len(), wiq = %queue.name, user = %identity.username, "workitems added");
        metrics::queue_operations().add(
            items.len() as u64,
            &[
                KeyValue::new("queue", queue.name.clone()),
                KeyValue::new("operation", "add"),
            ],
        );
        if relevant {
            self.monitor.notify(&queue.id);
        }
        Ok(items)
    }
}
