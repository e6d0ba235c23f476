//! UpdateWorkitem: field merge and the retry/terminal state machine.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::WorkitemEngine;
use crate::auth::AuthorizationGate;
use crate::error::{Error, Result};
use crate::model::workitem::{NewFile, RequestedState, Routing, normalize_payload};
use crate::model::{Identity, Right, State, Workitem, WorkitemQueue, time};
use crate::telemetry::spans;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateWorkitemRequest {
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub errormessage: Option<String>,
    #[serde(default)]
    pub errortype: Option<String>,
    #[serde(default)]
    pub errorsource: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wipriority: Option<i64>,
    /// Retry even when the queue's retry budget is spent, and do not treat
    /// business errors as final.
    #[serde(default)]
    pub ignoremaxretries: bool,
    /// Explicit next run for a retried item.
    #[serde(default, deserialize_with = "time::deserialize_optional")]
    pub nextrun: Option<DateTime<Utc>>,
    #[serde(default)]
    pub files: Vec<NewFile>,
    #[serde(flatten)]
    pub routing: Routing,
}

impl UpdateWorkitemRequest {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn error(mut self, message: impl Into<String>, errortype: Option<&str>) -> Self {
        self.errormessage = Some(message.into());
        self.errortype = errortype.map(str::to_string);
        self
    }

    pub fn ignore_max_retries(mut self) -> Self {
        self.ignoremaxretries = true;
        self
    }

    pub fn file(mut self, file: NewFile) -> Self {
        self.files.push(file);
        self
    }
}

/// Resolve a requested state against the item and its queue, mutating the
/// item's lifecycle fields.
pub(crate) fn apply_state(
    item: &mut Workitem,
    queue: &WorkitemQueue,
    requested: RequestedState,
    req: &UpdateWorkitemRequest,
    now: DateTime<Utc>,
) -> Result<()> {
    let old = item.state;
    let requested = match requested {
        RequestedState::New if old != State::New => {
            return Err(Error::InvalidState("new".to_string()));
        }
        RequestedState::Retry
            if req.errortype.as_deref() == Some("business") && !req.ignoremaxretries =>
        {
            RequestedState::Failed
        }
        other => other,
    };

    item.state = match requested {
        RequestedState::Retry => {
            if item.retries + 1 < queue.maxretries || req.ignoremaxretries {
                item.retries += 1;
                item.userid = None;
                item.username = None;
                item.nextrun = Some(
                    req.nextrun
                        .unwrap_or_else(|| now + Duration::seconds(queue.retrydelay as i64)),
                );
                State::New
            } else {
                State::Failed
            }
        }
        RequestedState::New => State::New,
        RequestedState::Processing => State::Processing,
        RequestedState::Successful => State::Successful,
        RequestedState::Failed => State::Failed,
    };

    if item.state == State::Processing && old != State::Processing {
        item.lastrun = Some(now);
    }
    Ok(())
}

impl WorkitemEngine {
    pub async fn update_workitem(
        &self,
        identity: &Identity,
        req: UpdateWorkitemRequest,
    ) -> Result<Workitem> {
        let id = req
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::mandatory("_id"))?;

        let mut item = self.load_workitem(identity, &id).await?;
        let queue = self
            .resolve_queue(&Identity::root(), Some(&item.wiqid), Some(&item.wiq))
            .await?;
        AuthorizationGate::require(identity, &item.acl, Right::Invoke, "work item")?;

        item.routing.apply(&req.routing);
        item.wiq = queue.name.clone();
        item.wiqid = queue.id.clone();
        if let Some(name) = req.name.as_deref().filter(|n| !n.is_empty()) {
            item.name = name.to_string();
        }
        if req.payload.is_some() {
            item.payload = normalize_payload(req.payload.clone());
        }
        if let Some(message) = &req.errormessage {
            item.errormessage = Some(message.clone());
            item.errortype = Some(
                req.errortype
                    .clone()
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| "application".to_string()),
            );
        }
        if let Some(source) = &req.errorsource {
            item.errorsource = Some(source.clone());
        }
        if let Some(priority) = req.priority.or(req.wipriority) {
            item.priority = priority;
        }

        let old = item.state;
        let now = Utc::now();
        if let Some(requested) = req.state.as_deref().filter(|s| !s.is_empty()) {
            apply_state(&mut item, &queue, requested.parse()?, &req, now)?;
        }

        for file in &req.files {
            if file.file.as_deref().is_none_or(str::is_empty) {
                continue;
            }
            let superseded: Vec<String> = item
                .files
                .iter()
                .filter(|f| f.name == file.filename)
                .map(|f| f.id.clone())
                .collect();
            for blob in &superseded {
                self.delete_blob(blob).await;
            }
            item.files.retain(|f| f.name != file.filename);
            item.files.extend(
                self.store_files(&item.id, &queue, std::slice::from_ref(file), identity)
                    .await,
            );
        }

        if item.state != State::New {
            item.nextrun = None;
        }
        item.audit.touch(identity);
        self.save_workitem(&item).await?;

        if old != item.state {
            spans::record_state_transition(&item.id, old.as_str(), item.state.as_str());
            tracing::info!(workitem = %item.id, from = %old, to = %item.state, retries = item.retries, "workitem updated");
            if item.state.is_terminal() {
                self.route_completed(identity, &item, &queue).await?;
            }
        }
        Ok(item)
    }
}
