//! Helpers shared by the per-state schemas.

use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::envelope::ErrorRecord;

/// Deserialize `data` into the typed input of a state.
pub(crate) fn parse<T: DeserializeOwned>(data: Map<String, Value>) -> Result<T, Vec<ErrorRecord>> {
    serde_json::from_value(Value::Object(data)).map_err(|e| vec![ErrorRecord::invalid(e.to_string())])
}

/// `{"message": "<literal>"}`, used by the handshake-like states.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Message {
    message: String,
}

/// Accept exactly `{"message": expected}`.
pub(crate) fn expect_message(data: Map<String, Value>, expected: &str) -> Result<(), Vec<ErrorRecord>> {
    let Message { message } = parse(data)?;
    if message == expected {
        Ok(())
    } else {
        Err(vec![ErrorRecord::invalid(format!("expected message {expected:?}, got {message:?}"))])
    }
}

/// Accumulates range violations so a client sees all of them at once.
#[derive(Debug, Default)]
pub(crate) struct Checks {
    errors: Vec<ErrorRecord>,
}

impl Checks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record `detail` unless `ok`.
    pub(crate) fn require(&mut self, ok: bool, detail: impl FnOnce() -> String) {
        if !ok {
            self.errors.push(ErrorRecord::invalid(detail()));
        }
    }

    /// `value` if nothing was recorded.
    pub(crate) fn finish<T>(self, value: T) -> Result<T, Vec<ErrorRecord>> {
        if self.errors.is_empty() { Ok(value) } else { Err(self.errors) }
    }
}
