//! The closed set of commands and their typed payloads.

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::documents::{
    CountRequest, DeleteManyRequest, DeleteOneRequest, InsertManyRequest, InsertOneRequest,
    QueryRequest, UpdateOneRequest,
};
use crate::error::{Error, Result};
use crate::namespace::{RegisterExchangeRequest, RegisterQueueRequest};
use crate::workitem::{
    AddWorkitemQueueRequest, AddWorkitemRequest, AddWorkitemsRequest, DeleteWorkitemQueueRequest,
    DeleteWorkitemRequest, GetWorkitemQueueRequest, PopWorkitemRequest, UpdateWorkitemQueueRequest,
    UpdateWorkitemRequest,
};

macro_rules! command_kinds {
    ($($kind:ident => $wire:literal),+ $(,)?) => {
        /// Command name without its payload.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum CommandKind {
            $($kind),+
        }

        impl CommandKind {
            pub const ALL: &'static [CommandKind] = &[$(CommandKind::$kind),+];

            /// Wire name, as sent in `Envelope::command`.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(CommandKind::$kind => $wire),+
                }
            }

            /// Name used for spans: `message.<name>`.
            pub fn span_name(self) -> &'static str {
                match self {
                    $(CommandKind::$kind => stringify!($kind)),+
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                let name = name.to_lowercase();
                match name.as_str() {
                    $($wire => Some(CommandKind::$kind),)+
                    _ => None,
                }
            }
        }
    };
}

command_kinds! {
    Ping => "ping",
    Error => "error",
    Signin => "signin",
    RefreshToken => "refreshtoken",
    Query => "query",
    Count => "count",
    InsertOne => "insertone",
    InsertMany => "insertmany",
    UpdateOne => "updateone",
    DeleteOne => "deleteone",
    DeleteMany => "deletemany",
    AddWorkitem => "addworkitem",
    AddWorkitems => "addworkitems",
    PopWorkitem => "popworkitem",
    UpdateWorkitem => "updateworkitem",
    DeleteWorkitem => "deleteworkitem",
    AddWorkitemQueue => "addworkitemqueue",
    GetWorkitemQueue => "getworkitemqueue",
    UpdateWorkitemQueue => "updateworkitemqueue",
    DeleteWorkitemQueue => "deleteworkitemqueue",
    RegisterQueue => "registerqueue",
    RegisterExchange => "registerexchange",
}

impl CommandKind {
    /// May run on an offload worker instead of the receiving process.
    /// Session and broker-namespace commands are bound to the connection.
    pub fn offloadable(self) -> bool {
        !matches!(
            self,
            CommandKind::Ping
                | CommandKind::Error
                | CommandKind::Signin
                | CommandKind::RefreshToken
                | CommandKind::RegisterQueue
                | CommandKind::RegisterExchange
        )
    }

    /// Needs a resolved identity before it can run.
    pub fn requires_identity(self) -> bool {
        !matches!(self, CommandKind::Ping | CommandKind::Error | CommandKind::Signin)
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct SigninRequest {
    #[serde(default)]
    pub jwt: Option<String>,
}

/// A decoded command, bound to its typed payload.
#[derive(Debug, Clone)]
pub enum Command {
    Ping,
    Error,
    Signin(SigninRequest),
    RefreshToken,
    Query(QueryRequest),
    Count(CountRequest),
    InsertOne(InsertOneRequest),
    InsertMany(InsertManyRequest),
    UpdateOne(UpdateOneRequest),
    DeleteOne(DeleteOneRequest),
    DeleteMany(DeleteManyRequest),
    AddWorkitem(AddWorkitemRequest),
    AddWorkitems(AddWorkitemsRequest),
    PopWorkitem(PopWorkitemRequest),
    UpdateWorkitem(UpdateWorkitemRequest),
    DeleteWorkitem(DeleteWorkitemRequest),
    AddWorkitemQueue(AddWorkitemQueueRequest),
    GetWorkitemQueue(GetWorkitemQueueRequest),
    UpdateWorkitemQueue(UpdateWorkitemQueueRequest),
    DeleteWorkitemQueue(DeleteWorkitemQueueRequest),
    RegisterQueue(RegisterQueueRequest),
    RegisterExchange(RegisterExchangeRequest),
}

fn decode<T: DeserializeOwned>(payload: Value) -> Result<T> {
    Ok(serde_json::from_value(payload)?)
}

/// Older clients nest queue fields under `workitemqueue` and keep the
/// flags next to it.
fn unwrap_queue(mut payload: Value) -> Value {
    let Some(mut inner) = payload.get_mut("workitemqueue").map(Value::take) else {
        return payload;
    };
    if let (Some(inner_obj), Some(outer)) = (inner.as_object_mut(), payload.as_object()) {
        for flag in ["skiprole", "purge"] {
            if let Some(value) = outer.get(flag) {
                inner_obj.insert(flag.to_string(), value.clone());
            }
        }
    }
    if inner.is_object() { inner } else { payload }
}

impl Command {
    pub fn parse(kind: CommandKind, payload: Value) -> Result<Self> {
        Ok(match kind {
            CommandKind::Ping => Command::Ping,
            CommandKind::Error => Command::Error,
            CommandKind::Signin => Command::Signin(decode(payload)?),
            CommandKind::RefreshToken => Command::RefreshToken,
            CommandKind::Query => Command::Query(decode(payload)?),
            CommandKind::Count => Command::Count(decode(payload)?),
            CommandKind::InsertOne => Command::InsertOne(decode(payload)?),
            CommandKind::InsertMany => Command::InsertMany(decode(payload)?),
            CommandKind::UpdateOne => Command::UpdateOne(decode(payload)?),
            CommandKind::DeleteOne => Command::DeleteOne(decode(payload)?),
            CommandKind::DeleteMany => Command::DeleteMany(decode(payload)?),
            CommandKind::AddWorkitem => Command::AddWorkitem(decode(payload)?),
            CommandKind::AddWorkitems => Command::AddWorkitems(decode(payload)?),
            CommandKind::PopWorkitem => Command::PopWorkitem(decode(payload)?),
            CommandKind::UpdateWorkitem => Command::UpdateWorkitem(decode(payload)?),
            CommandKind::DeleteWorkitem => Command::DeleteWorkitem(decode(payload)?),
            CommandKind::AddWorkitemQueue => Command::AddWorkitemQueue(decode(unwrap_queue(payload))?),
            CommandKind::GetWorkitemQueue => Command::GetWorkitemQueue(decode(payload)?),
            CommandKind::UpdateWorkitemQueue => {
                Command::UpdateWorkitemQueue(decode(unwrap_queue(payload))?)
            }
            CommandKind::DeleteWorkitemQueue => Command::DeleteWorkitemQueue(decode(payload)?),
            CommandKind::RegisterQueue => Command::RegisterQueue(decode(payload)?),
            CommandKind::RegisterExchange => Command::RegisterExchange(decode(payload)?),
        })
    }

    /// Look up `name` and decode its payload.
    pub fn from_envelope(name: &str, payload: Value) -> Result<Self> {
        let kind = CommandKind::from_name(name).ok_or_else(|| Error::UnknownCommand(name.to_string()))?;
        Self::parse(kind, payload)
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Ping => CommandKind::Ping,
            Command::Error => CommandKind::Error,
            Command::Signin(_) => CommandKind::Signin,
            Command::RefreshToken => CommandKind::RefreshToken,
            Command::Query(_) => CommandKind::Query,
            Command::Count(_) => CommandKind::Count,
            Command::InsertOne(_) => CommandKind::InsertOne,
            Command::InsertMany(_) => CommandKind::InsertMany,
            Command::UpdateOne(_) => CommandKind::UpdateOne,
            Command::DeleteOne(_) => CommandKind::DeleteOne,
            Command::DeleteMany(_) => CommandKind::DeleteMany,
            Command::AddWorkitem(_) => CommandKind::AddWorkitem,
            Command::AddWorkitems(_) => CommandKind::AddWorkitems,
            Command::PopWorkitem(_) => CommandKind::PopWorkitem,
            Command::UpdateWorkitem(_) => CommandKind::UpdateWorkitem,
            Command::DeleteWorkitem(_) => CommandKind::DeleteWorkitem,
            Command::AddWorkitemQueue(_) => CommandKind::AddWorkitemQueue,
            Command::GetWorkitemQueue(_) => CommandKind::GetWorkitemQueue,
            Command::UpdateWorkitemQueue(_) => CommandKind::UpdateWorkitemQueue,
            Command::DeleteWorkitemQueue(_) => CommandKind::DeleteWorkitemQueue,
            Command::RegisterQueue(_) => CommandKind::RegisterQueue,
            Command::RegisterExchange(_) => CommandKind::RegisterExchange,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn names_round_trip_and_are_case_insensitive() {
        for kind in CommandKind::ALL {
            assert_eq!(CommandKind::from_name(kind.as_str()), Some(*kind));
        }
        assert_eq!(CommandKind::from_name("PopWorkitem"), Some(CommandKind::PopWorkitem));
        assert_eq!(CommandKind::PopWorkitem.span_name(), "PopWorkitem");
    }

    #[test]
    fn unknown_command_is_an_error() {
        let err = Command::from_envelope("launchrockets", json!({})).unwrap_err();
        assert_eq!(err.to_string(), "Unknown command launchrockets");
    }

    #[test]
    fn payloads_are_typed() {
        let cmd = Command::from_envelope(
            "updateworkitem",
            json!({"_id": "abc", "state": "retry", "ignoremaxretries": true}),
        )
        .unwrap();
        let Command::UpdateWorkitem(req) = cmd else {
            panic!("wrong variant");
        };
        assert_eq!(req.id.as_deref(), Some("abc"));
        assert!(req.ignoremaxretries);
    }

    #[test]
    fn nested_queue_payload_is_unwrapped() {
        let cmd = Command::from_envelope(
            "addworkitemqueue",
            json!({"workitemqueue": {"name": "q", "maxretries": 3, "retrydelay": 0, "initialdelay": 0}, "skiprole": true}),
        )
        .unwrap();
        let Command::AddWorkitemQueue(req) = cmd else {
            panic!("wrong variant");
        };
        assert_eq!(req.name.as_deref(), Some("q"));
        assert!(req.skiprole);
    }

    #[test]
    fn session_commands_stay_local() {
        assert!(!CommandKind::Signin.offloadable());
        assert!(!CommandKind::RegisterQueue.offloadable());
        assert!(CommandKind::PopWorkitem.offloadable());
        assert!(!CommandKind::Signin.requires_identity());
    }
}
