/// Task messages and their stream encoding
///
/// A task travels through the stream as a single field:
///
/// ```text
/// body: "{\"id\":\"550e8400-...\",\"body\":{\"id\":1},\"timeout_secs\":30}"
/// ```
///
/// The field value is the JSON encoding of a [`TaskMessage`]. Entries are
/// never rewritten; a requeue re-adds the same field map as a new entry.
///
/// # Example
///
/// ```
/// use streamtask_shared::message::{decode_fields, encode_fields, TaskMessage};
/// use serde_json::json;
///
/// let task = TaskMessage::new(json!({"id": 1}));
/// let fields = encode_fields(&task).unwrap();
/// let decoded = decode_fields(&fields).unwrap();
/// assert_eq!(decoded.body, json!({"id": 1}));
/// ```

use crate::store::Fields;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

/// Name of the stream field carrying the encoded task
pub const BODY_FIELD: &str = "body";

/// Message encoding errors
#[derive(Error, Debug)]
pub enum MessageError {
    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A unit of work
///
/// `id` identifies the task across requeues, so consumers that must tolerate
/// duplicate delivery can deduplicate on it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Task identifier, stable across requeues
    #[serde(default)]
    pub id: Uuid,

    /// Opaque payload handed to the task handler
    #[serde(default)]
    pub body: JsonValue,

    /// Execution timeout in seconds (None = worker default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl TaskMessage {
    /// Creates a message with a fresh ID and no explicit timeout
    pub fn new(body: JsonValue) -> Self {
        TaskMessage {
            id: Uuid::new_v4(),
            body,
            timeout_secs: None,
        }
    }

    /// Sets the execution timeout
    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    /// Encodes the message as JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a message from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Encodes a task as a stream field map
pub fn encode_fields(task: &TaskMessage) -> Result<Fields, MessageError> {
    let mut fields = Fields::new();
    fields.insert(BODY_FIELD.to_string(), serde_json::to_string(task)?);
    Ok(fields)
}

/// Decodes a task from a stream field map
///
/// # Errors
///
/// Returns an error if the `body` field is missing or is not a valid
/// encoded task.
pub fn decode_fields(fields: &Fields) -> Result<TaskMessage, MessageError> {
    let body = fields
        .get(BODY_FIELD)
        .ok_or_else(|| MessageError::MissingField(BODY_FIELD.to_string()))?;
    Ok(serde_json::from_str(body)?)
}
