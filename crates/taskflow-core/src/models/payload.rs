use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque structured payload carried as a task's input or output.
///
/// The engine never looks inside; only workers and callers agree on the
/// schema. It can be wrapped into an envelope or measured, nothing more.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Value);

impl Payload {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn empty() -> Self {
        Self(Value::Null)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Length of the serialized form in bytes.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(&self.0).map(|bytes| bytes.len()).unwrap_or(0)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.0)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw).map(Self)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self(value)
    }
}
