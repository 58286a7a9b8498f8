//! Queue message model and its Redis stream entry encoding.

use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;
use uuid::Uuid;

use crate::error::QueueError;

/// Business payload carried by a message.
pub type Values = serde_json::Map<String, Value>;

/// Reserved payload key holding the host/tenant prefix.
pub const PREFIX_KEY: &str = "__host";

/// Stream entry field names.
pub const FIELD_ID: &str = "id";
pub const FIELD_STREAM: &str = "stream";
pub const FIELD_VALUES: &str = "values";
pub const FIELD_ERROR_COUNT: &str = "error_count";

#[derive(Debug, Clone, Default)]
struct MessageState {
    stream: String,
    values: Values,
    error_count: u32,
}

/// A unit of work travelling through a queue backend.
///
/// The id is fixed at construction. `stream`, `values` and `error_count`
/// sit behind the message's own lock because a consumer task bumps the
/// failure counter while the producer side may still be reading.
pub struct Message {
    id: String,
    state: RwLock<MessageState>,
}

impl Message {
    /// Create a message for `stream` with a freshly generated id.
    pub fn new(stream: impl Into<String>, values: Values) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), stream, values)
    }

    /// Create a message with an explicit id.
    pub fn with_id(id: impl Into<String>, stream: impl Into<String>, values: Values) -> Self {
        Self {
            id: id.into(),
            state: RwLock::new(MessageState {
                stream: stream.into(),
                values,
                error_count: 0,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, MessageState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, MessageState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream(&self) -> String {
        self.read().stream.clone()
    }

    pub fn set_stream(&self, stream: impl Into<String>) {
        self.write().stream = stream.into();
    }

    /// Copy of the payload.
    pub fn values(&self) -> Values {
        self.read().values.clone()
    }

    pub fn set_values(&self, values: Values) {
        self.write().values = values;
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        self.read().values.get(key).cloned()
    }

    pub fn insert_value(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.write().values.insert(key.into(), value.into());
    }

    /// Host prefix stored under the reserved `__host` key.
    pub fn prefix(&self) -> Option<String> {
        self.read()
            .values
            .get(PREFIX_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn set_prefix(&self, prefix: impl Into<String>) {
        self.write()
            .values
            .insert(PREFIX_KEY.to_string(), Value::String(prefix.into()));
    }

    pub fn error_count(&self) -> u32 {
        self.read().error_count
    }

    pub fn set_error_count(&self, count: u32) {
        self.write().error_count = count;
    }

    /// Count one failed delivery and return the new total, saturating at `u32::MAX`.
    pub fn record_failure(&self) -> u32 {
        let mut state = self.write();
        state.error_count = state.error_count.saturating_add(1);
        state.error_count
    }

    /// Encode as a flat stream entry: `id`, `stream`, JSON `values`, decimal `error_count`.
    pub fn to_entry_fields(&self) -> Result<Vec<(&'static str, String)>, QueueError> {
        let state = self.read();
        let values = serde_json::to_string(&state.values)?;

        Ok(vec![
            (FIELD_ID, self.id.clone()),
            (FIELD_STREAM, state.stream.clone()),
            (FIELD_VALUES, values),
            (FIELD_ERROR_COUNT, state.error_count.to_string()),
        ])
    }

    /// Rebuild a message from a stream entry.
    ///
    /// Missing fields fall back to the entry id, the stream the entry was
    /// read from, an empty payload and a zero error count.
    pub fn from_entry(
        entry_id: &str,
        source_stream: &str,
        fields: &HashMap<String, String>,
    ) -> Result<Self, QueueError> {
        let malformed = |reason: String| QueueError::MalformedEntry {
            entry_id: entry_id.to_string(),
            reason,
        };

        let id = fields
            .get(FIELD_ID)
            .filter(|id| !id.is_empty())
            .cloned()
            .unwrap_or_else(|| entry_id.to_string());

        let stream = fields
            .get(FIELD_STREAM)
            .filter(|s| !s.is_empty())
            .cloned()
            .unwrap_or_else(|| source_stream.to_string());

        let values = match fields.get(FIELD_VALUES) {
            Some(raw) => serde_json::from_str::<Values>(raw)
                .map_err(|e| malformed(format!("values is not a JSON object: {}", e)))?,
            None => Values::new(),
        };

        let error_count = match fields.get(FIELD_ERROR_COUNT) {
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .map_err(|e| malformed(format!("error_count {:?}: {}", raw, e)))?,
            None => 0,
        };

        let message = Self::with_id(id, stream, values);
        message.set_error_count(error_count);
        Ok(message)
    }
}

impl Clone for Message {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            state: RwLock::new(self.read().clone()),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read();
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("stream", &state.stream)
            .field("error_count", &state.error_count)
            .finish()
    }
}
