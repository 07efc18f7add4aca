//! Frames exchanged with the task event socket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{FrameError, Result};
use crate::message::{Role, ToolCall, deserialize_optional_id};

/// Event type reserved for heartbeat replies.
pub const PONG_EVENT_TYPE: &str = "pong";

/// Event type carrying cumulative streaming fragments.
pub const MESSAGE_STREAMING_EVENT_TYPE: &str = "message_streaming";

/// A decoded server event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event_type: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: String::new(),
            task_id: None,
            payload: Map::new(),
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = timestamp.into();
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn is_streaming_fragment(&self) -> bool {
        self.event_type == MESSAGE_STREAMING_EVENT_TYPE
    }

    /// Envelope timestamp parsed as RFC 3339, when it is one.
    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(self.timestamp.trim())
            .ok()
            .map(|value| value.with_timezone(&Utc))
    }

    /// Interpret a `message_streaming` envelope as a fragment.
    pub fn decode_fragment(&self) -> Result<StreamingFragment> {
        if !self.is_streaming_fragment() {
            return Err(FrameError::Fragment(format!(
                "expected {MESSAGE_STREAMING_EVENT_TYPE} event, got {}",
                self.event_type
            )));
        }

        let task_id = self
            .task_id
            .clone()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| FrameError::Fragment("missing task_id".to_string()))?;
        let fields: FragmentFields = serde_json::from_value(Value::Object(self.payload.clone()))
            .map_err(|error| FrameError::Fragment(error.to_string()))?;
        let message_id = fields
            .message_id
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| FrameError::Fragment("missing message_id".to_string()))?;

        Ok(StreamingFragment {
            task_id,
            message_id,
            role: fields.role.unwrap_or(Role::Assistant),
            content: fields.content.unwrap_or_default(),
            reasoning: fields.reasoning.unwrap_or_default(),
            tool_calls: fields.tool_calls,
            tool_call_id: fields.tool_call_id,
            name: fields.name,
            stream_index: fields.stream_index.unwrap_or_default(),
            message_index: fields.message_index,
            is_complete: fields.is_complete.unwrap_or(false),
            created_at: self.parsed_timestamp(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct FragmentFields {
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    message_id: Option<String>,
    #[serde(default)]
    role: Option<Role>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    tool_call_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    stream_index: Option<u64>,
    #[serde(default)]
    message_index: Option<i64>,
    #[serde(default)]
    is_complete: Option<bool>,
}

/// One cumulative update for an in-progress message. Content fields carry the
/// full accumulated value, never a delta.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingFragment {
    pub task_id: String,
    pub message_id: String,
    pub role: Role,
    pub content: String,
    pub reasoning: String,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub tool_call_id: Option<String>,
    pub name: Option<String>,
    pub stream_index: u64,
    pub message_index: Option<i64>,
    pub is_complete: bool,
    pub created_at: Option<DateTime<Utc>>,
}

/// Frame received from the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Pong,
    Event(Envelope),
}

/// Frame sent to the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Ping,
}

impl OutboundFrame {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Decode one text frame. Accepts a heartbeat reply, an `{"event": {...}}`
/// wrapper, or a bare event object.
pub fn decode_frame(text: &str) -> Result<InboundFrame> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(mut object) = value else {
        return Err(FrameError::Malformed(
            "expected JSON object frame".to_string(),
        ));
    };

    if object.get("type").and_then(Value::as_str) == Some(PONG_EVENT_TYPE) {
        return Ok(InboundFrame::Pong);
    }

    if let Some(inner) = object.remove("event") {
        let Value::Object(inner) = inner else {
            return Err(FrameError::Malformed("invalid event payload".to_string()));
        };
        object = inner;
    }

    let event_type = match object.remove("event_type") {
        Some(Value::String(event_type)) if !event_type.trim().is_empty() => event_type,
        Some(_) => return Err(FrameError::Malformed("invalid event_type".to_string())),
        None => return Err(FrameError::Malformed("missing event_type".to_string())),
    };
    if event_type == PONG_EVENT_TYPE {
        return Ok(InboundFrame::Pong);
    }

    let timestamp = match object.remove("timestamp") {
        Some(Value::String(timestamp)) => timestamp,
        Some(Value::Null) | None => String::new(),
        Some(_) => return Err(FrameError::Malformed("invalid timestamp".to_string())),
    };
    let task_id = match object.remove("task_id") {
        Some(Value::String(task_id)) => Some(task_id),
        Some(Value::Number(task_id)) => Some(task_id.to_string()),
        Some(Value::Null) | None => None,
        Some(_) => return Err(FrameError::Malformed("invalid task_id".to_string())),
    };

    Ok(InboundFrame::Event(Envelope {
        event_type,
        timestamp,
        task_id,
        payload: object,
    }))
}
