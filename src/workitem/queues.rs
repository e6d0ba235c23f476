//! Workitem queue management: add, get, update (with purge) and delete.

use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};

use super::WorkitemEngine;
use crate::auth::AuthorizationGate;
use crate::error::{Error, Result};
use crate::event::AuditKind;
use crate::model::acl::add_right;
use crate::model::queue::DEFAULT_MAX_RETRIES;
use crate::model::workitem::Routing;
use crate::model::{
    self, Ace, Audit, Identity, Right, Rights, RoleRef, WorkitemQueue, collections, types,
    wellknown,
};
use crate::store::{Filter, Query};
use crate::telemetry::metrics;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddWorkitemQueueRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub maxretries: Option<u32>,
    #[serde(default)]
    pub retrydelay: Option<u64>,
    #[serde(default)]
    pub initialdelay: Option<u64>,
    #[serde(default)]
    pub workflowid: Option<String>,
    #[serde(default)]
    pub robotqueue: Option<String>,
    #[serde(default)]
    pub amqpqueue: Option<String>,
    #[serde(default)]
    pub projectid: Option<String>,
    #[serde(default)]
    pub packageid: Option<String>,
    #[serde(flatten)]
    pub routing: Routing,
    /// Do not create the "<name> users" role; grant queue admins instead.
    #[serde(default)]
    pub skiprole: bool,
    #[serde(rename = "_acl", default, skip_serializing_if = "Option::is_none")]
    pub acl: Option<Vec<Ace>>,
}

impl AddWorkitemQueueRequest {
    pub fn new(name: impl Into<String>, maxretries: u32, retrydelay: u64, initialdelay: u64) -> Self {
        Self {
            name: Some(name.into()),
            maxretries: Some(maxretries),
            retrydelay: Some(retrydelay),
            initialdelay: Some(initialdelay),
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

    pub fn skip_role(mut self) -> Self {
        self.skiprole = true;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetWorkitemQueueRequest {
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Patch for an existing queue. Absent fields are left alone; an empty
/// string clears an optional field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateWorkitemQueueRequest {
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub maxretries: Option<u32>,
    #[serde(default)]
    pub retrydelay: Option<u64>,
    #[serde(default)]
    pub initialdelay: Option<u64>,
    #[serde(default)]
    pub workflowid: Option<String>,
    #[serde(default)]
    pub robotqueue: Option<String>,
    #[serde(default)]
    pub amqpqueue: Option<String>,
    #[serde(default)]
    pub projectid: Option<String>,
    #[serde(default)]
    pub packageid: Option<String>,
    #[serde(flatten)]
    pub routing: Routing,
    #[serde(rename = "_acl", default, skip_serializing_if = "Option::is_none")]
    pub acl: Option<Vec<Ace>>,
    /// Delete every item (and its files) in the queue.
    #[serde(default)]
    pub purge: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteWorkitemQueueRequest {
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wiq: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wiqid: Option<String>,
    #[serde(default)]
    pub purge: bool,
}

impl DeleteWorkitemQueueRequest {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn purge(mut self) -> Self {
        self.purge = true;
        self
    }
}

/// A role document in the users collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Role {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_type")]
    entity_type: String,
    name: String,
    #[serde(default)]
    members: Vec<RoleRef>,
    #[serde(rename = "_acl", default)]
    acl: Vec<Ace>,
    #[serde(flatten)]
    audit: Audit,
}

impl Role {
    fn add_member(&mut self, id: &str, name: &str) {
        if !self.members.iter().any(|m| m.id == id) {
            self.members.push(RoleRef {
                id: id.to_string(),
                name: name.to_string(),
            });
        }
    }
}

fn merge(slot: &mut Option<String>, value: &Option<String>) {
    match value.as_deref() {
        Some("") => *slot = None,
        Some(v) => *slot = Some(v.to_string()),
        None => {}
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn items_of(queue_id: &str) -> Filter {
    Filter::eq("_type", types::WORKITEM).and(Filter::eq("wiqid", queue_id))
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

impl WorkitemEngine {
    pub async fn add_workitem_queue(
        &self,
        identity: &Identity,
        req: AddWorkitemQueueRequest,
    ) -> Result<WorkitemQueue> {
        let name = non_empty(&req.name).ok_or_else(|| Error::mandatory("name"))?;
        let maxretries = req.maxretries.ok_or_else(|| Error::mandatory("maxretries"))?;
        let retrydelay = req.retrydelay.ok_or_else(|| Error::mandatory("retrydelay"))?;
        let initialdelay = req.initialdelay.ok_or_else(|| Error::mandatory("initialdelay"))?;

        if self.find_queue(&Identity::root(), None, Some(name)).await?.is_some() {
            return Err(Error::Validation(format!(
                "Work item queue with name {name} already exists"
            )));
        }

        let admins = self
            .ensure_role(
                wellknown::WORKITEM_QUEUE_ADMINS_NAME,
                Some(wellknown::WORKITEM_QUEUE_ADMINS_ID),
                identity,
            )
            .await?;

        let mut acl = Vec::new();
        let mut usersrole = None;
        if req.skiprole {
            add_right(&mut acl, &admins.id, &admins.name, Rights::FULL_CONTROL);
        } else {
            let mut users = self.ensure_role(&format!("{name} users"), None, identity).await?;
            add_right(&mut users.acl, wellknown::ADMINS_ID, wellknown::ADMINS_NAME, Rights::FULL_CONTROL);
            add_right(&mut users.acl, &identity.id, &identity.name, Rights::FULL_CONTROL);
            users.add_member(&identity.id, &identity.name);
            users.add_member(&admins.id, &admins.name);
            self.save_role(&users).await?;
            add_right(&mut acl, &users.id, &users.name, Rights::FULL_CONTROL);
            usersrole = Some(users.id);
        }
        if let Some(explicit) = &req.acl {
            acl = explicit.clone();
        }

        let queue = WorkitemQueue {
            id: model::new_id(),
            entity_type: types::WORKITEM_QUEUE.to_string(),
            name: name.to_string(),
            maxretries: if maxretries < 1 { DEFAULT_MAX_RETRIES } else { maxretries },
            retrydelay,
            initialdelay,
            routing: req.routing.clone(),
            workflowid: non_empty(&req.workflowid).map(str::to_string),
            robotqueue: req.robotqueue.clone(),
            amqpqueue: req.amqpqueue.clone(),
            projectid: req.projectid.clone(),
            packageid: req.packageid.clone(),
            usersrole,
            acl,
            audit: Audit::created_by(identity),
        };

        // Inserted as the caller, so the creator ends up with full control.
        let doc = self
            .store
            .insert_one(collections::MQ, model::to_document(&queue)?, identity)
            .await?;
        let queue: WorkitemQueue = model::from_document(doc)?;

        tracing::info!(wiq = %queue.name, wiqid = %queue.id, user = %identity.username, "workitem queue added");
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", queue.name.clone()),
                KeyValue::new("operation", "add_queue"),
            ],
        );
        Ok(queue)
    }

    pub async fn get_workitem_queue(
        &self,
        identity: &Identity,
        req: GetWorkitemQueueRequest,
    ) -> Result<Option<WorkitemQueue>> {
        if non_empty(&req.id).is_none() && non_empty(&req.name).is_none() {
            return Err(Error::mandatory("name or _id"));
        }
        self.find_queue(identity, req.id.as_deref(), req.name.as_deref())
            .await
    }

    pub async fn update_workitem_queue(
        &self,
        identity: &Identity,
        req: UpdateWorkitemQueueRequest,
    ) -> Result<WorkitemQueue> {
        let mut queue = self
            .lookup_queue(identity, req.id.as_deref(), req.name.as_deref())
            .await?;
        AuthorizationGate::require(identity, &queue.acl, Right::Update, "work item queue")?;

        if let Some(name) = non_empty(&req.name).filter(|n| *n != queue.name) {
            if self.find_queue(&Identity::root(), None, Some(name)).await?.is_some() {
                return Err(Error::Validation(format!(
                    "Work item queue with name {name} already exists"
                )));
            }
            queue.name = name.to_string();
        }
        if let Some(maxretries) = req.maxretries {
            queue.maxretries = if maxretries < 1 { DEFAULT_MAX_RETRIES } else { maxretries };
        }
        if let Some(retrydelay) = req.retrydelay {
            queue.retrydelay = retrydelay;
        }
        if let Some(initialdelay) = req.initialdelay {
            queue.initialdelay = initialdelay;
        }
        merge(&mut queue.workflowid, &req.workflowid);
        merge(&mut queue.robotqueue, &req.robotqueue);
        merge(&mut queue.amqpqueue, &req.amqpqueue);
        merge(&mut queue.projectid, &req.projectid);
        merge(&mut queue.packageid, &req.packageid);
        queue.routing.apply(&req.routing);
        if let Some(acl) = &req.acl {
            queue.acl = acl.clone();
        }
        queue.audit.touch(identity);

        let updated = self
            .store
            .update_one(
                collections::MQ,
                &Filter::id(&queue.id),
                model::to_document(&queue)?,
                &Identity::root(),
            )
            .await?;
        if updated == 0 {
            return Err(Error::NotFound(format!(
                "Work item queue with _id {} not found.",
                queue.id
            )));
        }
        tracing::info!(wiq = %queue.name, wiqid = %queue.id, purge = req.purge, "workitem queue updated");

        if req.purge {
            self.purge_queue(identity, &queue).await?;
        }
        Ok(queue)
    }

    pub async fn delete_workitem_queue(
        &self,
        identity: &Identity,
        req: DeleteWorkitemQueueRequest,
    ) -> Result<()> {
        let id = non_empty(&req.wiqid).or(non_empty(&req.id));
        let name = non_empty(&req.wiq).or(non_empty(&req.name));
        let queue = self.lookup_queue(identity, id, name).await?;
        AuthorizationGate::require(identity, &queue.acl, Right::Delete, "work item queue")?;

        if req.purge {
            self.purge_queue(identity, &queue).await?;
        } else {
            let query = Query::new(items_of(&queue.id)).top(1);
            let remaining = self
                .store
                .query(collections::WORKITEMS, &query, &Identity::root())
                .await?;
            if !remaining.is_empty() {
                return Err(Error::NotEmpty(queue.name));
            }
        }

        let root = Identity::root();
        self.store.delete_one(collections::MQ, &queue.id, &root).await?;
        if let Some(role) = non_empty(&queue.usersrole) {
            if !self.store.delete_one(collections::USERS, role, &root).await? {
                tracing::warn!(wiq = %queue.name, role, "queue users role already gone");
            }
        }
        self.monitor.forget(&queue.id);

        tracing::info!(wiq = %queue.name, wiqid = %queue.id, user = %identity.username, "workitem queue deleted");
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", queue.name.clone()),
                KeyValue::new("operation", "delete_queue"),
            ],
        );
        self.audit
            .record(
                identity,
                AuditKind::QueueDeleted {
                    wiqid: queue.id.clone(),
                    wiq: queue.name.clone(),
                },
            )
            .await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Lookup for update/delete: id wins, and the error names what was asked for.
    async fn lookup_queue(
        &self,
        identity: &Identity,
        id: Option<&str>,
        name: Option<&str>,
    ) -> Result<WorkitemQueue> {
        let id = id.filter(|s| !s.is_empty());
        let name = name.filter(|s| !s.is_empty());
        match (id, name) {
            (Some(id), _) => self.find_queue(identity, Some(id), None).await?.ok_or_else(|| {
                Error::NotFound(format!("Work item queue with _id {id} not found."))
            }),
            (None, Some(name)) => self
                .find_queue(identity, None, Some(name))
                .await?
                .ok_or_else(|| Error::NotFound(format!("Work item queue with name {name} not found."))),
            (None, None) => Err(Error::mandatory("name or _id")),
        }
    }

    /// Delete every item and file of `queue`, then verify nothing is left.
    /// Residual items mean something raced the purge; that is an error.
    async fn purge_queue(&self, identity: &Identity, queue: &WorkitemQueue) -> Result<()> {
        let root = Identity::root();
        let filter = items_of(&queue.id);
        let workitems = self
            .store
            .delete_many(collections::WORKITEMS, &filter, &root)
            .await?;

        let remaining = self.store.count(collections::WORKITEMS, &filter, &root).await?;
        if remaining > 0 {
            tracing::error!(wiq = %queue.name, remaining, "items left after purge");
            return Err(Error::PurgeFailed(queue.name.clone()));
        }

        let files = self.delete_queue_blobs(&queue.id).await?;
        tracing::info!(wiq = %queue.name, workitems, files, "workitem queue purged");
        self.audit
            .record(
                identity,
                AuditKind::QueuePurged {
                    wiqid: queue.id.clone(),
                    wiq: queue.name.clone(),
                    workitems,
                    files,
                },
            )
            .await;
        Ok(())
    }

    /// Find a role by name, creating it (with `id` if given) when missing.
    async fn ensure_role(&self, name: &str, id: Option<&str>, identity: &Identity) -> Result<Role> {
        let root = Identity::root();
        let by_type = Filter::eq("_type", types::ROLE);
        let mut found = Vec::new();
        if let Some(id) = id {
            found = self
                .store
                .query(collections::USERS, &Query::new(Filter::id(id).and(by_type.clone())).top(1), &root)
                .await?;
        }
        if found.is_empty() {
            found = self
                .store
                .query(collections::USERS, &Query::new(Filter::eq("name", name).and(by_type)).top(1), &root)
                .await?;
        }
        if let Some(doc) = found.into_iter().next() {
            return model::from_document(doc);
        }

        let role = Role {
            id: id.map(str::to_string).unwrap_or_else(model::new_id),
            entity_type: types::ROLE.to_string(),
            name: name.to_string(),
            members: Vec::new(),
            acl: vec![Ace::allow(wellknown::ADMINS_ID, wellknown::ADMINS_NAME, Rights::FULL_CONTROL)],
            audit: Audit::created_by(identity),
        };
        let doc = self
            .store
            .insert_one(collections::USERS, model::to_document(&role)?, &root)
            .await?;
        tracing::debug!(role = name, "created role");
        model::from_document(doc)
    }

    async fn save_role(&self, role: &Role) -> Result<()> {
        self.store
            .update_one(
                collections::USERS,
                &Filter::id(&role.id),
                model::to_document(role)?,
                &Identity::root(),
            )
            .await?;
        Ok(())
    }
}
