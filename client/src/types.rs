//! Public data model: connection state, server responses, session metadata,
//! and lifecycle notifications.

use serde::{Deserialize, Serialize};

/// Connection state of a [`CopilotClient`](crate::client::CopilotClient).
///
/// Owned exclusively by the client; transitions happen only through supervisor
/// lifecycle events or explicit stop/force-stop calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Stopping,
}

/// Response from a `ping` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    #[serde(default)]
    pub message: String,
    /// Server timestamp in milliseconds.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub protocol_version: Option<u64>,
}

/// Response from `status.get`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetStatusResponse {
    pub version: String,
    pub protocol_version: u64,
}

/// Response from `auth.getStatus`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetAuthStatusResponse {
    pub is_authenticated: bool,
    #[serde(default)]
    pub auth_type: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub status_message: Option<String>,
}

/// Vision-specific model limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelVisionLimits {
    #[serde(default)]
    pub supported_media_types: Vec<String>,
    #[serde(default)]
    pub max_prompt_images: u32,
    #[serde(default)]
    pub max_prompt_image_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelLimits {
    #[serde(default)]
    pub max_prompt_tokens: Option<u64>,
    #[serde(default)]
    pub max_context_window_tokens: u64,
    #[serde(default)]
    pub vision: Option<ModelVisionLimits>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSupports {
    #[serde(default)]
    pub vision: bool,
    #[serde(default)]
    pub reasoning_effort: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCapabilities {
    pub supports: ModelSupports,
    pub limits: ModelLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPolicy {
    pub state: String,
    #[serde(default)]
    pub terms: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelBilling {
    pub multiplier: f64,
}

/// Metadata about a model available through `models.list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub capabilities: ModelCapabilities,
    #[serde(default)]
    pub policy: Option<ModelPolicy>,
    #[serde(default)]
    pub billing: Option<ModelBilling>,
    #[serde(default)]
    pub supported_reasoning_efforts: Vec<String>,
    #[serde(default)]
    pub default_reasoning_effort: Option<String>,
}

/// Metadata about a persisted session, from `session.list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub session_id: String,
    #[serde(default)]
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub modified_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub is_remote: bool,
}

/// Type of a session lifecycle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionLifecycleEventType {
    #[serde(rename = "session.created")]
    Created,
    #[serde(rename = "session.deleted")]
    Deleted,
    #[serde(rename = "session.updated")]
    Updated,
    #[serde(rename = "session.foreground")]
    Foreground,
    #[serde(rename = "session.background")]
    Background,
}

/// A client-scoped session lifecycle notification. Emitted when sessions are
/// created, deleted, updated, or change foreground state (TUI+server mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLifecycleEvent {
    #[serde(rename = "type")]
    pub event_type: SessionLifecycleEventType,
    pub session_id: String,
    #[serde(default)]
    pub metadata: Option<SessionLifecycleEventMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLifecycleEventMetadata {
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub modified_time: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_response_tolerates_missing_protocol_version() {
        let resp: PingResponse =
            serde_json::from_value(serde_json::json!({"message": "pong", "timestamp": 5}))
                .unwrap();
        assert_eq!(resp.protocol_version, None);
    }

    #[test]
    fn lifecycle_event_parses_wire_type_names() {
        let event: SessionLifecycleEvent = serde_json::from_value(serde_json::json!({
            "type": "session.foreground",
            "sessionId": "s1",
        }))
        .unwrap();
        assert_eq!(event.event_type, SessionLifecycleEventType::Foreground);
        assert_eq!(event.session_id, "s1");
    }

    #[test]
    fn model_info_round_trips_reasoning_fields() {
        let info: ModelInfo = serde_json::from_value(serde_json::json!({
            "id": "claude-sonnet-4.5",
            "name": "Claude Sonnet 4.5",
            "capabilities": {
                "supports": {"vision": true, "reasoningEffort": true},
                "limits": {"max_context_window_tokens": 200000},
            },
            "supportedReasoningEfforts": ["low", "medium", "high"],
        }))
        .unwrap();
        assert!(info.capabilities.supports.reasoning_effort);
        assert_eq!(info.supported_reasoning_efforts.len(), 3);
    }
}
