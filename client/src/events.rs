//! Session event model.
//!
//! Every notification a session can produce is represented by one variant of
//! [`SessionEvent`]; wire shapes that do not correspond to a known variant are
//! preserved in [`SessionEvent::Unknown`] rather than dropped, so a host can
//! still observe (and log) everything the server sends.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload attached to a session event.
///
/// The server varies which fields are present per event type; everything it
/// sends beyond the known fields is retained in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventData {
    /// Message content. Either a plain string or an array of content blocks
    /// (`[{"type": "text", "text": "..."}]`); use
    /// [`EventData::content_text`] to read it uniformly.
    pub content: Option<Value>,
    /// Incremental content for `*.delta` events when streaming is enabled.
    pub delta_content: Option<String>,
    /// Error or status message. A string for `session.error`, an object with
    /// nested content for some assistant shapes.
    pub message: Option<Value>,
    /// ID of the user message this event belongs to.
    pub message_id: Option<String>,
    pub tool_name: Option<String>,
    pub tool_call_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl EventData {
    /// Extract text content from the payload.
    ///
    /// Handles the shapes the CLI is known to emit:
    /// - `{ "content": "text" }` - string content
    /// - `{ "content": [{ "type": "text", "text": "..." }] }` - content blocks
    /// - `{ "message": { "content": "text" } }` - nested message
    /// - `{ "text": "..." }` - direct text field
    pub fn content_text(&self) -> Option<String> {
        if let Some(s) = self.content.as_ref().and_then(|c| c.as_str())
            && !s.is_empty()
        {
            return Some(s.to_string());
        }

        if let Some(arr) = self.content.as_ref().and_then(|c| c.as_array()) {
            let mut text = String::new();
            for block in arr {
                if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(t);
                }
            }
            if !text.is_empty() {
                return Some(text);
            }
        }

        if let Some(s) = self
            .message
            .as_ref()
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            && !s.is_empty()
        {
            return Some(s.to_string());
        }

        if let Some(s) = self.extra.get("text").and_then(|t| t.as_str())
            && !s.is_empty()
        {
            return Some(s.to_string());
        }

        None
    }

    /// The server-reported error message for `session.error` events.
    pub fn error_message(&self) -> Option<&str> {
        self.message.as_ref().and_then(|m| m.as_str())
    }
}

/// A single event in a session's stream.
///
/// Ordering within one session is transport arrival order. Each event belongs
/// to exactly one turn, delimited by a `user.message` event and the following
/// `session.idle` or `session.error`.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    UserMessage { data: EventData },
    AssistantMessage { data: EventData },
    AssistantMessageDelta { data: EventData },
    AssistantReasoning { data: EventData },
    AssistantReasoningDelta { data: EventData },
    ToolExecutionStart { data: EventData },
    ToolExecutionComplete { data: EventData },
    SessionIdle { data: EventData },
    SessionError { data: EventData },
    CompactionStart { data: EventData },
    CompactionComplete { data: EventData },
    UsageInfo { data: EventData },
    /// An event shape this client does not model. The raw payload is kept so
    /// nothing the server sends is silently lost.
    Unknown { event_type: String, payload: Value },
}

impl SessionEvent {
    /// Parse a wire event object (`{"type": "...", "data": {...}}`).
    ///
    /// Total: every input maps to exactly one variant, with `Unknown` as the
    /// fallback for unmodeled types and malformed payloads.
    pub fn from_value(value: Value) -> SessionEvent {
        let event_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();

        let data = match value.get("data") {
            None => EventData::default(),
            Some(d) => match serde_json::from_value::<EventData>(d.clone()) {
                Ok(data) => data,
                Err(_) => {
                    return SessionEvent::Unknown {
                        event_type,
                        payload: value,
                    };
                }
            },
        };

        match event_type.as_str() {
            "user.message" => SessionEvent::UserMessage { data },
            "assistant.message" => SessionEvent::AssistantMessage { data },
            "assistant.message.delta" | "assistant.message_delta" => {
                SessionEvent::AssistantMessageDelta { data }
            }
            "assistant.reasoning" => SessionEvent::AssistantReasoning { data },
            "assistant.reasoning.delta" | "assistant.reasoning_delta" => {
                SessionEvent::AssistantReasoningDelta { data }
            }
            "tool.execution_start" => SessionEvent::ToolExecutionStart { data },
            "tool.execution_complete" => SessionEvent::ToolExecutionComplete { data },
            "session.idle" => SessionEvent::SessionIdle { data },
            "session.error" => SessionEvent::SessionError { data },
            "session.compaction_start" => SessionEvent::CompactionStart { data },
            "session.compaction_complete" => SessionEvent::CompactionComplete { data },
            "session.usage_info" => SessionEvent::UsageInfo { data },
            _ => SessionEvent::Unknown {
                event_type,
                payload: value,
            },
        }
    }

    /// The wire name of this event's type.
    pub fn event_type(&self) -> &str {
        match self {
            SessionEvent::UserMessage { .. } => "user.message",
            SessionEvent::AssistantMessage { .. } => "assistant.message",
            SessionEvent::AssistantMessageDelta { .. } => "assistant.message.delta",
            SessionEvent::AssistantReasoning { .. } => "assistant.reasoning",
            SessionEvent::AssistantReasoningDelta { .. } => "assistant.reasoning.delta",
            SessionEvent::ToolExecutionStart { .. } => "tool.execution_start",
            SessionEvent::ToolExecutionComplete { .. } => "tool.execution_complete",
            SessionEvent::SessionIdle { .. } => "session.idle",
            SessionEvent::SessionError { .. } => "session.error",
            SessionEvent::CompactionStart { .. } => "session.compaction_start",
            SessionEvent::CompactionComplete { .. } => "session.compaction_complete",
            SessionEvent::UsageInfo { .. } => "session.usage_info",
            SessionEvent::Unknown { event_type, .. } => event_type,
        }
    }

    /// The event payload, if this is a modeled variant.
    pub fn data(&self) -> Option<&EventData> {
        match self {
            SessionEvent::UserMessage { data }
            | SessionEvent::AssistantMessage { data }
            | SessionEvent::AssistantMessageDelta { data }
            | SessionEvent::AssistantReasoning { data }
            | SessionEvent::AssistantReasoningDelta { data }
            | SessionEvent::SessionIdle { data }
            | SessionEvent::SessionError { data }
            | SessionEvent::ToolExecutionStart { data }
            | SessionEvent::ToolExecutionComplete { data }
            | SessionEvent::CompactionStart { data }
            | SessionEvent::CompactionComplete { data }
            | SessionEvent::UsageInfo { data } => Some(data),
            SessionEvent::Unknown { .. } => None,
        }
    }

    /// Text content of this event, when it carries any.
    pub fn content_text(&self) -> Option<String> {
        self.data().and_then(|d| d.content_text())
    }
}

/// Find the final assistant message of the most recent completed turn.
///
/// Within the slice after the last `user.message`, locates a `session.idle`
/// event and scans backward from it for the nearest `assistant.message`.
///
/// - No idle yet: the turn is still in progress -> `Ok(None)`.
/// - A `session.error` in the turn: `Err(Error::Session)` with the
///   server-reported message.
/// - Idle with neither an assistant message nor an error: the server broke
///   its contract -> `Err(Error::Protocol)`.
pub fn last_turn_result(events: &[SessionEvent]) -> Result<Option<&SessionEvent>> {
    let start = events
        .iter()
        .rposition(|e| matches!(e, SessionEvent::UserMessage { .. }))
        .map(|i| i + 1)
        .unwrap_or(0);
    let turn = &events[start..];

    if let Some(err) = turn
        .iter()
        .find(|e| matches!(e, SessionEvent::SessionError { .. }))
    {
        let message = err
            .data()
            .and_then(|d| d.error_message())
            .unwrap_or("unknown session error");
        return Err(Error::Session(message.to_string()));
    }

    let Some(idle_idx) = turn
        .iter()
        .position(|e| matches!(e, SessionEvent::SessionIdle { .. }))
    else {
        return Ok(None);
    };

    match turn[..idle_idx]
        .iter()
        .rev()
        .find(|e| matches!(e, SessionEvent::AssistantMessage { .. }))
    {
        Some(event) => Ok(Some(event)),
        None => Err(Error::Protocol(
            "session became idle without producing an assistant message".into(),
        )),
    }
}
