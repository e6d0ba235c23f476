//! Workitems and their lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Ace, Audit, time, types};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a workitem. No other states exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Claimable once `nextrun` is due.
    #[default]
    New,
    /// Claimed by a consumer.
    Processing,
    /// Done. Terminal.
    Successful,
    /// Gave up. Terminal.
    Failed,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Successful | State::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::New => "new",
            State::Processing => "processing",
            State::Successful => "successful",
            State::Failed => "failed",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A state a client may ask UpdateWorkitem for. `Retry` is resolved by the
/// engine into `New` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedState {
    New,
    Processing,
    Successful,
    Failed,
    Retry,
}

impl std::str::FromStr for RequestedState {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "new" => Ok(RequestedState::New),
            "processing" => Ok(RequestedState::Processing),
            "successful" => Ok(RequestedState::Successful),
            "failed" => Ok(RequestedState::Failed),
            "retry" => Ok(RequestedState::Retry),
            _ => Err(crate::error::Error::InvalidState(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

/// Reference from a workitem to a stored blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkitemFile {
    /// Logical name as supplied by the client (may include a path).
    pub name: String,
    /// Base name of `name`.
    pub filename: String,
    /// Blob id.
    #[serde(rename = "_id")]
    pub id: String,
    /// Base64 content, only filled in when a pop asks for files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

/// Inline file payload sent with AddWorkitem(s)/UpdateWorkitem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewFile {
    pub filename: String,
    /// Base64 content; zlib-deflated first when `compressed` is set.
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub compressed: bool,
}

// ---------------------------------------------------------------------------
// Workitem
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workitem {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_type", default = "workitem_type")]
    pub entity_type: String,
    pub name: String,
    /// Owning queue name, denormalized for display.
    pub wiq: String,
    pub wiqid: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub state: State,
    #[serde(default)]
    pub retries: u32,
    #[serde(
        default,
        deserialize_with = "time::deserialize_optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub nextrun: Option<DateTime<Utc>>,
    #[serde(
        default,
        deserialize_with = "time::deserialize_optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub lastrun: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errormessage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errortype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errorsource: Option<String>,
    #[serde(default)]
    pub files: Vec<WorkitemFile>,
    #[serde(flatten)]
    pub routing: Routing,
    #[serde(rename = "_acl", default)]
    pub acl: Vec<Ace>,
    #[serde(flatten)]
    pub audit: Audit,
}

/// Where an item goes when it reaches a terminal state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Routing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_wiq: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_wiqid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_wiq: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_wiqid: Option<String>,
}

impl Routing {
    pub fn is_empty(&self) -> bool {
        self.success_wiq.is_none()
            && self.success_wiqid.is_none()
            && self.failed_wiq.is_none()
            && self.failed_wiqid.is_none()
    }

    /// The (id, name) target for an item that ended in `state`.
    pub fn target_for(&self, state: State) -> (Option<&str>, Option<&str>) {
        let (id, name) = match state {
            State::Successful => (&self.success_wiqid, &self.success_wiq),
            State::Failed => (&self.failed_wiqid, &self.failed_wiq),
            _ => return (None, None),
        };
        (non_empty(id), non_empty(name))
    }

    /// Apply client-supplied overrides. An empty string clears a field.
    pub fn apply(&mut self, patch: &Routing) {
        fn merge(slot: &mut Option<String>, value: &Option<String>) {
            match value.as_deref() {
                Some("") => *slot = None,
                Some(v) => *slot = Some(v.to_string()),
                None => {}
            }
        }
        merge(&mut self.success_wiq, &patch.success_wiq);
        merge(&mut self.success_wiqid, &patch.success_wiqid);
        merge(&mut self.failed_wiq, &patch.failed_wiq);
        merge(&mut self.failed_wiqid, &patch.failed_wiqid);
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn workitem_type() -> String {
    types::WORKITEM.to_string()
}

pub fn default_priority() -> i64 {
    2
}

pub const DEFAULT_NAME: &str = "New work item";

/// Wrap non-object payloads so every stored payload is an object.
pub fn normalize_payload(payload: Option<serde_json::Value>) -> serde_json::Value {
    match payload {
        None | Some(serde_json::Value::Null) => serde_json::json!({}),
        Some(value @ serde_json::Value::Object(_)) => value,
        Some(other) => serde_json::json!({ "value": other }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requested_state_parses_case_insensitively() {
        assert_eq!("Retry".parse::<RequestedState>().unwrap(), RequestedState::Retry);
        assert!("abandoned".parse::<RequestedState>().is_err());
    }

    #[test]
    fn payload_scalars_are_wrapped() {
        assert_eq!(normalize_payload(Some(json!(5))), json!({"value": 5}));
        assert_eq!(normalize_payload(None), json!({}));
        assert_eq!(normalize_payload(Some(json!({"a": 1}))), json!({"a": 1}));
    }

    #[test]
    fn item_level_routing_targets_follow_state() {
        let routing = Routing {
            success_wiqid: Some("q2".into()),
            failed_wiq: Some("errors".into()),
            ..Default::default()
        };
        assert_eq!(routing.target_for(State::Successful), (Some("q2"), None));
        assert_eq!(routing.target_for(State::Failed), (None, Some("errors")));
        assert_eq!(routing.target_for(State::New), (None, None));
    }

    #[test]
    fn empty_override_clears_routing() {
        let mut routing = Routing {
            success_wiq: Some("next".into()),
            ..Default::default()
        };
        routing.apply(&Routing {
            success_wiq: Some(String::new()),
            ..Default::default()
        });
        assert!(routing.is_empty());
    }

    #[test]
    fn workitem_document_accepts_protobuf_timestamps() {
        let item: Workitem = serde_json::from_value(json!({
            "_id": "i1",
            "name": "job",
            "wiq": "q",
            "wiqid": "qid",
            "state": "new",
            "nextrun": {"seconds": 1_709_287_200, "nanos": 0}
        }))
        .unwrap();
        assert_eq!(item.priority, 2);
        assert_eq!(item.entity_type, "workitem");
        assert_eq!(item.nextrun.unwrap().timestamp(), 1_709_287_200);
    }
}
