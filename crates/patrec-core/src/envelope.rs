//! Wire envelope.
//!
//! Every server message is `{"success": true, "data": {...}}` or
//! `{"success": false, "errors": [{"title", "detail"}, ...]}`. Every client
//! message is `{"data": {...}}`; what `data` may contain depends on the
//! receiving task's current state and is checked by that task, not here.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Title used for envelope and schema violations.
pub const INVALID_MESSAGE: &str = "The message is invalid";

/// One entry of a failure envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Short, stable summary
    pub title: String,
    /// Human readable explanation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorRecord {
    /// Error with a title only.
    pub fn new(title: impl Into<String>) -> Self {
        Self { title: title.into(), detail: None }
    }

    /// Error with a title and a detail line.
    pub fn with_detail(title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { title: title.into(), detail: Some(detail.into()) }
    }

    /// Schema violation with the given detail.
    pub fn invalid(detail: impl Into<String>) -> Self {
        Self::with_detail(INVALID_MESSAGE, detail)
    }
}

/// Server to client message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// `true` iff `data` is present
    pub success: bool,
    /// Payload of a successful reply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Errors of a failed reply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<ErrorRecord>>,
}

impl Envelope {
    /// Successful reply carrying `data`.
    pub fn success(data: Value) -> Self {
        Self { success: true, data: Some(data), errors: None }
    }

    /// Failed reply carrying `errors`.
    pub fn failure(errors: Vec<ErrorRecord>) -> Self {
        Self { success: false, data: None, errors: Some(errors) }
    }

    /// Serialize to the text frame sent on the wire.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Client to server message, before the per-state check.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientEnvelope {
    /// State-specific payload
    pub data: Map<String, Value>,
}

impl ClientEnvelope {
    /// Parse a raw payload, rejecting anything that is not `{"data": {...}}`.
    pub fn parse(raw: &str) -> Result<Self, ErrorRecord> {
        serde_json::from_str(raw).map_err(|e| ErrorRecord::invalid(e.to_string()))
    }
}
