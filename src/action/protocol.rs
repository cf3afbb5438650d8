//! Command, result and push envelopes
//!
//! Wire format (JSON, one envelope per callback invocation):
//! ```text
//! Command: {"id": "...", "method": "...", "data": <any>}
//! Result:  {"id": "...", "method": "...", "data": <any>, "code": 0 | -1}
//! Push:    {"id": "", "method": "message", "data": {"type": "...", "data": <any>}, "code": 0}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// `code` of a successful result
pub const CODE_SUCCESS: i32 = 0;
/// `code` of a failed result; `data` then holds the diagnostic text
pub const CODE_FAILURE: i32 = -1;

/// Method name carried by push envelopes
pub const MESSAGE_METHOD: &str = "message";

/// A command sent by the host
///
/// `id` is opaque to the bridge and echoed back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub data: Value,
}

impl Action {
    pub fn new(id: impl Into<String>, method: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            data,
        }
    }

    /// Parse a command envelope
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Successful result for this command
    pub fn success(&self, payload: impl Serialize) -> ActionResult {
        ActionResult::success(&self.id, &self.method, payload)
    }

    /// Failed result for this command
    pub fn failure(&self, message: impl Into<String>) -> ActionResult {
        ActionResult::failure(&self.id, &self.method, message)
    }
}

/// The single response to one [`Action`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub id: String,
    pub method: String,
    pub data: Value,
    pub code: i32,
}

impl ActionResult {
    /// A `code = 0` result carrying `payload`
    ///
    /// A payload that cannot be represented as JSON turns the result into a
    /// failure carrying the serialization error.
    pub fn success(id: &str, method: &str, payload: impl Serialize) -> Self {
        match serde_json::to_value(payload) {
            Ok(data) => Self {
                id: id.to_string(),
                method: method.to_string(),
                data,
                code: CODE_SUCCESS,
            },
            Err(e) => Self::failure(id, method, e.to_string()),
        }
    }

    pub fn failure(id: &str, method: &str, message: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            method: method.to_string(),
            data: Value::String(message.into()),
            code: CODE_FAILURE,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == CODE_SUCCESS
    }

    /// Serialize for delivery to the host
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            json!({
                "id": self.id,
                "method": self.method,
                "data": e.to_string(),
                "code": CODE_FAILURE,
            })
            .to_string()
        })
    }
}

/// Kind of an unsolicited push message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Log,
    Delay,
    Memory,
    Connections,
}

/// An unsolicited notification for the event listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub data: Value,
}

impl Message {
    pub fn new(kind: MessageType, data: impl Serialize) -> Self {
        let data = serde_json::to_value(data).unwrap_or_else(|e| Value::String(e.to_string()));
        Self { kind, data }
    }

    /// Wrap into the push envelope, which carries no request id
    pub fn into_result(self) -> ActionResult {
        ActionResult::success("", MESSAGE_METHOD, self)
    }
}
