//! Protocol translation between the client's method vocabulary and the wire
//! dialect in effect.
//!
//! The client speaks one protocol-agnostic vocabulary (`session.create`,
//! `session.send`, `ping`, ...). Depending on which dialect the server was
//! started with, those operations are renamed and reshaped before hitting the
//! wire, and inbound notifications are reshaped back into the common
//! [`SessionEvent`] vocabulary:
//!
//! - **Native**: the Copilot CLI server protocol. Method names pass through
//!   unchanged; `session.event` notifications carry typed events directly.
//! - **Acp**: the Agent Client Protocol. `session.create` becomes
//!   `session/new`, the liveness probe becomes the `initialize` handshake, and
//!   `session/update` notifications are mapped onto event variants. A
//!   documented subset of operations has no ACP equivalent and is rejected
//!   client-side before any wire traffic.

use crate::error::{Error, Result};
use crate::events::{EventData, SessionEvent};
use serde_json::Value;

/// ACP protocol revision sent in the `initialize` handshake.
pub const ACP_PROTOCOL_VERSION: u64 = 1;

/// Wire dialect, fixed at client construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    #[default]
    Native,
    Acp,
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dialect::Native => write!(f, "native"),
            Dialect::Acp => write!(f, "acp"),
        }
    }
}

/// Operations with no ACP equivalent. Calls made under the ACP dialect fail
/// immediately client-side; no request is sent.
const ACP_UNSUPPORTED: &[&str] = &[
    "status.get",
    "auth.getStatus",
    "models.list",
    "session.list",
    "session.delete",
    "session.getMessages",
    "session.destroy",
    "session.getForeground",
    "session.setForeground",
];

impl Dialect {
    /// Whether `operation` can be expressed at all under this dialect.
    pub fn supports(&self, operation: &str) -> bool {
        match self {
            Dialect::Native => true,
            Dialect::Acp => !ACP_UNSUPPORTED.contains(&operation),
        }
    }

    /// Map a protocol-agnostic operation name to its wire method name.
    pub fn wire_method(&self, operation: &str) -> Result<&'static str> {
        match self {
            Dialect::Native => match operation {
                "ping" => Ok("ping"),
                "status.get" => Ok("status.get"),
                "auth.getStatus" => Ok("auth.getStatus"),
                "models.list" => Ok("models.list"),
                "session.create" => Ok("session.create"),
                "session.resume" => Ok("session.resume"),
                "session.send" => Ok("session.send"),
                "session.abort" => Ok("session.abort"),
                "session.destroy" => Ok("session.destroy"),
                "session.delete" => Ok("session.delete"),
                "session.list" => Ok("session.list"),
                "session.getMessages" => Ok("session.getMessages"),
                "session.getForeground" => Ok("session.getForeground"),
                "session.setForeground" => Ok("session.setForeground"),
                other => Err(Error::Protocol(format!("unknown operation '{other}'"))),
            },
            Dialect::Acp => match operation {
                "ping" => Ok("initialize"),
                "session.create" => Ok("session/new"),
                "session.resume" => Ok("session/load"),
                "session.send" => Ok("session/prompt"),
                "session.abort" => Ok("session/cancel"),
                other if ACP_UNSUPPORTED.contains(&other) => Err(Error::UnsupportedOperation {
                    dialect: *self,
                    operation: other.to_string(),
                }),
                other => Err(Error::Protocol(format!("unknown operation '{other}'"))),
            },
        }
    }

    /// Reshape outgoing request params to the wire dialect's schema.
    ///
    /// Native params pass through unchanged. ACP reshapes the prompt into
    /// content blocks and renames the handshake parameters.
    pub fn translate_params(&self, operation: &str, params: Value) -> Value {
        match self {
            Dialect::Native => params,
            Dialect::Acp => match operation {
                "ping" => serde_json::json!({
                    "protocolVersion": ACP_PROTOCOL_VERSION,
                    "clientCapabilities": {},
                }),
                "session.create" => serde_json::json!({
                    "cwd": params.get("workingDirectory").cloned().unwrap_or(Value::Null),
                    "mcpServers": [],
                }),
                "session.resume" => serde_json::json!({
                    "sessionId": params.get("sessionId").cloned().unwrap_or(Value::Null),
                    "mcpServers": [],
                }),
                "session.send" => {
                    let prompt = params
                        .get("prompt")
                        .and_then(|p| p.as_str())
                        .unwrap_or_default();
                    serde_json::json!({
                        "sessionId": params.get("sessionId").cloned().unwrap_or(Value::Null),
                        "prompt": [{"type": "text", "text": prompt}],
                    })
                }
                "session.abort" => serde_json::json!({
                    "sessionId": params.get("sessionId").cloned().unwrap_or(Value::Null),
                }),
                _ => params,
            },
        }
    }
}

/// An inbound notification after dialect reshaping.
#[derive(Debug)]
pub enum InboundEvent {
    /// A session-scoped event, routed by session id.
    Session {
        session_id: String,
        event: SessionEvent,
    },
    /// A client-scoped session lifecycle notification.
    Lifecycle(Value),
    /// A notification with no mapping in the common vocabulary.
    Unknown { method: String, params: Value },
}

/// Reshape a wire notification into the protocol-agnostic vocabulary.
///
/// Total over both dialects: every accepted notification maps to exactly one
/// [`InboundEvent`]; untranslatable shapes become [`InboundEvent::Unknown`],
/// and untranslatable session updates become [`SessionEvent::Unknown`].
pub fn translate_notification(dialect: Dialect, method: &str, params: Value) -> InboundEvent {
    match dialect {
        Dialect::Native => match method {
            "session.event" => {
                let session_id = params
                    .get("sessionId")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                let event = params.get("event").cloned();
                match (session_id, event) {
                    (Some(session_id), Some(event)) => InboundEvent::Session {
                        session_id,
                        event: SessionEvent::from_value(event),
                    },
                    _ => InboundEvent::Unknown {
                        method: method.to_string(),
                        params,
                    },
                }
            }
            "session.lifecycle" => InboundEvent::Lifecycle(params),
            _ => InboundEvent::Unknown {
                method: method.to_string(),
                params,
            },
        },
        Dialect::Acp => match method {
            "session/update" => translate_acp_update(params),
            _ => InboundEvent::Unknown {
                method: method.to_string(),
                params,
            },
        },
    }
}

/// Map an ACP `session/update` notification onto the event vocabulary.
fn translate_acp_update(params: Value) -> InboundEvent {
    let Some(session_id) = params
        .get("sessionId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
    else {
        return InboundEvent::Unknown {
            method: "session/update".to_string(),
            params,
        };
    };

    // ACP nests the union under "update"; some agents flatten it.
    let update = params.get("update").cloned().unwrap_or_else(|| params.clone());
    let kind = update
        .get("sessionUpdate")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let text = |u: &Value| -> Option<String> {
        u.get("content")
            .and_then(|c| c.get("text"))
            .and_then(|t| t.as_str())
            .map(|s| s.to_string())
    };

    let event = match kind.as_str() {
        "agent_message_chunk" => SessionEvent::AssistantMessageDelta {
            data: EventData {
                delta_content: text(&update),
                ..Default::default()
            },
        },
        "user_message_chunk" => SessionEvent::UserMessage {
            data: EventData {
                content: text(&update).map(Value::String),
                ..Default::default()
            },
        },
        "agent_thought_chunk" | "thought" => SessionEvent::AssistantReasoningDelta {
            data: EventData {
                delta_content: text(&update),
                ..Default::default()
            },
        },
        "tool_call" => SessionEvent::ToolExecutionStart {
            data: EventData {
                tool_call_id: update
                    .get("toolCallId")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                tool_name: update
                    .get("title")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                ..Default::default()
            },
        },
        "tool_call_update" => {
            let data = EventData {
                tool_call_id: update
                    .get("toolCallId")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                ..Default::default()
            };
            let status = update
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            match status {
                "completed" | "failed" | "cancelled" => {
                    SessionEvent::ToolExecutionComplete { data }
                }
                _ => SessionEvent::ToolExecutionStart { data },
            }
        }
        _ => SessionEvent::Unknown {
            event_type: format!("session/update.{kind}"),
            payload: update,
        },
    };

    InboundEvent::Session { session_id, event }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_methods_pass_through() {
        assert_eq!(Dialect::Native.wire_method("ping").unwrap(), "ping");
        assert_eq!(
            Dialect::Native.wire_method("session.send").unwrap(),
            "session.send"
        );
    }

    #[test]
    fn acp_renames_session_methods() {
        assert_eq!(
            Dialect::Acp.wire_method("session.create").unwrap(),
            "session/new"
        );
        assert_eq!(
            Dialect::Acp.wire_method("session.send").unwrap(),
            "session/prompt"
        );
        assert_eq!(
            Dialect::Acp.wire_method("session.abort").unwrap(),
            "session/cancel"
        );
    }

    #[test]
    fn acp_maps_liveness_probe_to_initialize() {
        assert_eq!(Dialect::Acp.wire_method("ping").unwrap(), "initialize");
    }

    #[test]
    fn acp_rejects_unsupported_operations_by_name() {
        for op in ["session.list", "session.getForeground", "models.list", "status.get"] {
            let err = Dialect::Acp.wire_method(op).unwrap_err();
            match err {
                Error::UnsupportedOperation { dialect, operation } => {
                    assert_eq!(dialect, Dialect::Acp);
                    assert_eq!(operation, op);
                }
                other => panic!("expected UnsupportedOperation, got {other:?}"),
            }
        }
    }

    #[test]
    fn acp_send_params_become_content_blocks() {
        let params = serde_json::json!({"sessionId": "s1", "prompt": "hello", "mode": "enqueue"});
        let wire = Dialect::Acp.translate_params("session.send", params);
        assert_eq!(wire["sessionId"], "s1");
        assert_eq!(wire["prompt"][0]["type"], "text");
        assert_eq!(wire["prompt"][0]["text"], "hello");
    }

    #[test]
    fn native_notification_routes_session_event() {
        let params = serde_json::json!({
            "sessionId": "s1",
            "event": {"type": "assistant.message", "data": {"content": "hi"}},
        });
        let inbound = translate_notification(Dialect::Native, "session.event", params);
        let InboundEvent::Session { session_id, event } = inbound else {
            panic!("expected session event");
        };
        assert_eq!(session_id, "s1");
        assert!(matches!(event, SessionEvent::AssistantMessage { .. }));
    }

    #[test]
    fn acp_message_chunk_becomes_delta() {
        let params = serde_json::json!({
            "sessionId": "s1",
            "update": {
                "sessionUpdate": "agent_message_chunk",
                "content": {"type": "text", "text": "chunk"},
            },
        });
        let inbound = translate_notification(Dialect::Acp, "session/update", params);
        let InboundEvent::Session { event, .. } = inbound else {
            panic!("expected session event");
        };
        let SessionEvent::AssistantMessageDelta { data } = event else {
            panic!("expected delta");
        };
        assert_eq!(data.delta_content.as_deref(), Some("chunk"));
    }

    #[test]
    fn acp_tool_call_update_maps_terminal_statuses() {
        let params = serde_json::json!({
            "sessionId": "s1",
            "update": {
                "sessionUpdate": "tool_call_update",
                "toolCallId": "t1",
                "status": "completed",
            },
        });
        let InboundEvent::Session { event, .. } =
            translate_notification(Dialect::Acp, "session/update", params)
        else {
            panic!("expected session event");
        };
        assert!(matches!(event, SessionEvent::ToolExecutionComplete { .. }));
    }

    #[test]
    fn acp_unmodeled_update_is_preserved_not_dropped() {
        let params = serde_json::json!({
            "sessionId": "s1",
            "update": {"sessionUpdate": "plan", "entries": []},
        });
        let InboundEvent::Session { event, .. } =
            translate_notification(Dialect::Acp, "session/update", params)
        else {
            panic!("expected session event");
        };
        let SessionEvent::Unknown { event_type, .. } = event else {
            panic!("expected unknown variant");
        };
        assert_eq!(event_type, "session/update.plan");
    }

    #[test]
    fn unknown_notification_method_is_unknown() {
        let inbound = translate_notification(
            Dialect::Native,
            "server.metrics",
            serde_json::json!({}),
        );
        assert!(matches!(inbound, InboundEvent::Unknown { .. }));
    }
}
