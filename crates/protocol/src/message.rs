use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Application message carried inside a `message` frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Message {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: Some(name.into()),
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Size counted against the negotiated message size limit: name,
    /// client id, data and extras. String data counts its UTF-8 length,
    /// anything else its JSON encoding.
    pub fn size(&self) -> usize {
        let name = self.name.as_ref().map_or(0, String::len);
        let client_id = self.client_id.as_ref().map_or(0, String::len);
        name + client_id + value_size(self.data.as_ref()) + value_size(self.extras.as_ref())
    }
}

fn value_size(value: Option<&Value>) -> usize {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::String(s)) => s.len(),
        Some(other) => other.to_string().len(),
    }
}
