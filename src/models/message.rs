//! Request and result messages.
//!
//! A `Message` is what a caller hands to an endpoint. `collection` and
//! `operation` are routing hints consumed before dispatch; `payload` carries
//! the positional arguments going in and the operation result coming out.
//! Any other fields ride along untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default)]
    pub payload: Value,
    /// Set only on messages routed to the failure channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            ..Self::default()
        }
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    /// Take the routing hints out of the message.
    pub fn take_routing(&mut self) -> (Option<String>, Option<String>) {
        (self.collection.take(), self.operation.take())
    }

    /// Positional arguments for the operation.
    ///
    /// A non-array payload becomes a single argument. An empty argument list
    /// is padded with one `null` since most operations take at least one
    /// argument.
    pub fn arguments(&self) -> Vec<Value> {
        let mut args = match &self.payload {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        };
        if args.is_empty() {
            args.push(Value::Null);
        }
        args
    }

    /// Copy of this message carrying `result` as payload.
    pub fn with_payload(&self, result: Value) -> Self {
        Self {
            payload: result,
            ..self.clone()
        }
    }

    /// Copy of this message carrying an error description.
    pub fn with_error(&self, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..self.clone()
        }
    }
}

/// Strip transport internals from an operation result.
///
/// `connection` at the top level and under `result` is removed; non-array
/// results also lose the verbose `message` field.
pub fn normalize_result(result: Value) -> Value {
    match result {
        Value::Object(mut map) => {
            map.remove("connection");
            if let Some(Value::Object(inner)) = map.get_mut("result") {
                inner.remove("connection");
            }
            map.remove("message");
            Value::Object(map)
        }
        other => other,
    }
}
