//! Wire envelope for requests and replies.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::Error;
use crate::model;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub id: String,
    /// Set on replies: the id of the request being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replyto: Option<String>,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
    #[serde(rename = "correlationId", default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(rename = "traceId", default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(rename = "spanId", default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clientagent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clientversion: Option<String>,
}

impl Envelope {
    /// A fresh request.
    pub fn request(command: impl Into<String>, data: Value) -> Self {
        Self {
            id: model::new_id(),
            command: command.into(),
            data,
            ..Default::default()
        }
    }

    pub fn with_jwt(mut self, jwt: impl Into<String>) -> Self {
        self.jwt = Some(jwt.into());
        self
    }

    pub fn is_reply(&self) -> bool {
        self.replyto.as_deref().is_some_and(|r| !r.is_empty())
    }

    /// Credential carried by the request, on the envelope or inside `data`.
    pub fn credential(&self) -> Option<String> {
        self.jwt
            .as_deref()
            .or_else(|| self.data.get("jwt").and_then(Value::as_str))
            .filter(|jwt| !jwt.is_empty())
            .map(str::to_string)
    }

    /// The request payload, decoding it first if it arrived as a JSON string.
    pub fn payload(&self) -> Value {
        match &self.data {
            Value::String(raw) => serde_json::from_str(raw).unwrap_or_else(|_| json!({})),
            Value::Null => json!({}),
            other => other.clone(),
        }
    }

    /// Reply carrying `data`. Credentials never travel back.
    pub fn reply(&self, data: Value) -> Envelope {
        let mut data = data;
        if let Some(obj) = data.as_object_mut() {
            obj.remove("jwt");
        }
        Envelope {
            id: model::new_id(),
            replyto: Some(self.id.clone()),
            command: self.command.clone(),
            data,
            jwt: None,
            correlation_id: self.correlation_id.clone(),
            trace_id: self.trace_id.clone(),
            span_id: self.span_id.clone(),
            clientagent: None,
            clientversion: None,
        }
    }

    /// Reply echoing the request payload with `result` added.
    pub fn reply_with_result(&self, result: Value) -> Envelope {
        let mut data = self.payload();
        match data.as_object_mut() {
            Some(obj) => {
                obj.insert("result".into(), result);
            }
            None => data = json!({ "result": result }),
        }
        self.reply(data)
    }

    pub fn error_reply(&self, error: &Error) -> Envelope {
        let mut reply = self.reply(json!({ "message": error.to_string() }));
        reply.command = "error".into();
        reply
    }

    /// Message of an error reply.
    pub fn error_message(&self) -> Option<&str> {
        if self.command != "error" {
            return None;
        }
        self.data.get("message").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_are_camel_case_where_expected() {
        let env: Envelope = serde_json::from_value(json!({
            "id": "1", "command": "popworkitem", "data": "{\"wiq\":\"q\"}",
            "correlationId": "c", "traceId": "t", "spanId": "s"
        }))
        .unwrap();
        assert_eq!(env.correlation_id.as_deref(), Some("c"));
        assert_eq!(env.payload(), json!({"wiq": "q"}));

        let out = serde_json::to_value(env.reply(json!({}))).unwrap();
        assert_eq!(out["correlationId"], "c");
        assert_eq!(out["replyto"], "1");
    }

    #[test]
    fn replies_strip_credentials() {
        let env = Envelope::request("query", json!({"jwt": "secret", "collectionname": "x"}))
            .with_jwt("secret");
        assert_eq!(env.credential().as_deref(), Some("secret"));

        let reply = env.reply_with_result(json!([]));
        assert!(reply.jwt.is_none());
        assert!(reply.data.get("jwt").is_none());
        assert_eq!(reply.data["collectionname"], "x");
    }

    #[test]
    fn error_replies_carry_message() {
        let env = Envelope::request("nope", json!({}));
        let reply = env.error_reply(&Error::UnknownCommand("nope".into()));
        assert_eq!(reply.command, "error");
        assert_eq!(reply.error_message(), Some("Unknown command nope"));
    }
}
