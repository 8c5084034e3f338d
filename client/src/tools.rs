//! Tool-call bridge: host-registered tools, result normalization, and the
//! handlers the server can invoke on the client (permissions, user input,
//! hooks).
//!
//! A tool call is a server-to-host request: the model decides to invoke a
//! named capability, the CLI forwards the request over the wire, and this
//! module executes the registered handler and normalizes whatever comes back
//! into a result envelope. A failing or missing handler always produces a
//! standardized failure result; it never surfaces as a client error and never
//! leaves the server-side call unanswered.

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::warn;

/// Error type host handlers may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A tool call initiated by the server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub session_id: String,
    /// Unique per call; exactly one handler execution is in flight per id.
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Binary payload returned by a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolBinaryResult {
    pub data: String,
    pub mime_type: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Result envelope returned to the server for a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    /// The text the model sees.
    #[serde(rename = "textResultForLlm")]
    pub text_result_for_llm: String,
    #[serde(
        rename = "binaryResultsForLlm",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub binary_results_for_llm: Option<Vec<ToolBinaryResult>>,
    /// "success" or "failure".
    pub result_type: String,
    /// Detailed error, kept out of the model-facing text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_log: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub tool_telemetry: serde_json::Map<String, Value>,
}

impl ToolResult {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            text_result_for_llm: text.into(),
            binary_results_for_llm: None,
            result_type: "success".to_string(),
            error: None,
            session_log: None,
            tool_telemetry: serde_json::Map::new(),
        }
    }
}

/// A failure envelope for a tool that is not registered with the session.
pub(crate) fn unsupported_tool_result(tool_name: &str) -> ToolResult {
    ToolResult {
        text_result_for_llm: format!(
            "Tool '{tool_name}' is not supported by this client instance."
        ),
        binary_results_for_llm: None,
        result_type: "failure".to_string(),
        error: Some(format!("tool '{tool_name}' not supported")),
        session_log: None,
        tool_telemetry: serde_json::Map::new(),
    }
}

/// A failure envelope for a handler that returned an error or panicked.
/// The detail stays in `error`; the model-facing text is deliberately vague.
pub(crate) fn failed_tool_result(internal_error: impl Into<String>) -> ToolResult {
    ToolResult {
        text_result_for_llm:
            "Invoking this tool produced an error. Detailed information is not available."
                .to_string(),
        binary_results_for_llm: None,
        result_type: "failure".to_string(),
        error: Some(internal_error.into()),
        session_log: None,
        tool_telemetry: serde_json::Map::new(),
    }
}

/// What a tool handler produces. Plain text and plain values are auto-wrapped
/// as success; returning a full [`ToolResult`] controls metadata or reports a
/// handled failure.
#[derive(Debug, Clone)]
pub enum ToolOutput {
    Text(String),
    Value(Value),
    Result(ToolResult),
}

impl ToolOutput {
    pub(crate) fn into_result(self) -> ToolResult {
        match self {
            ToolOutput::Text(text) => ToolResult::success(text),
            ToolOutput::Value(value) => {
                let text = serde_json::to_string(&value).unwrap_or_default();
                ToolResult::success(text)
            }
            ToolOutput::Result(result) => result,
        }
    }
}

impl From<String> for ToolOutput {
    fn from(s: String) -> Self {
        ToolOutput::Text(s)
    }
}

impl From<&str> for ToolOutput {
    fn from(s: &str) -> Self {
        ToolOutput::Text(s.to_string())
    }
}

impl From<Value> for ToolOutput {
    fn from(v: Value) -> Self {
        ToolOutput::Value(v)
    }
}

impl From<ToolResult> for ToolOutput {
    fn from(r: ToolResult) -> Self {
        ToolOutput::Result(r)
    }
}

/// Executes a tool invocation.
pub type ToolHandler = Arc<
    dyn Fn(ToolInvocation) -> BoxFuture<'static, Result<ToolOutput, HandlerError>> + Send + Sync,
>;

/// A caller-implemented tool exposed to the CLI.
#[derive(Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's input parameters.
    pub parameters: Value,
    pub handler: ToolHandler,
}

impl Tool {
    pub fn new<F, Fut, O>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(ToolInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, HandlerError>> + Send + 'static,
        O: Into<ToolOutput>,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            handler: Arc::new(move |invocation| {
                handler(invocation).map(|r| r.map(Into::into)).boxed()
            }),
        }
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Wire shape of a tool definition, sent in `session.create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl From<&Tool> for ToolDefinition {
    fn from(tool: &Tool) -> Self {
        Self {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.parameters.clone(),
        }
    }
}

/// Run a registered handler (or reject an unregistered name) and normalize
/// the outcome into a [`ToolResult`]. Handler errors and panics are converted
/// to failure envelopes here; nothing escapes to the connection.
pub(crate) async fn run_tool_call(
    handler: Option<ToolHandler>,
    invocation: ToolInvocation,
) -> ToolResult {
    let tool_name = invocation.tool_name.clone();
    let Some(handler) = handler else {
        warn!("tool.call for unregistered tool '{}'", tool_name);
        return unsupported_tool_result(&tool_name);
    };

    match AssertUnwindSafe(handler(invocation)).catch_unwind().await {
        Ok(Ok(output)) => output.into_result(),
        Ok(Err(err)) => failed_tool_result(err.to_string()),
        Err(_) => {
            warn!("tool handler for '{}' panicked", tool_name);
            failed_tool_result(format!("tool '{tool_name}' handler panicked"))
        }
    }
}

// --- Permission requests -------------------------------------------------

/// A permission request from the server (e.g. before a file write).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Decision returned for a permission request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequestResult {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<Value>>,
}

impl PermissionRequestResult {
    /// The denial returned when no handler is registered or a handler fails.
    pub fn denied() -> Self {
        Self {
            kind: "denied-no-approval-rule-and-could-not-request-from-user".to_string(),
            rules: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PermissionInvocation {
    pub session_id: String,
}

pub type PermissionHandler = Arc<
    dyn Fn(PermissionRequest, PermissionInvocation) -> BoxFuture<'static, PermissionRequestResult>
        + Send
        + Sync,
>;

// --- User input requests -------------------------------------------------

/// A request for user input from the agent (the `ask_user` tool).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputRequest {
    pub question: String,
    #[serde(default)]
    pub choices: Vec<String>,
    #[serde(default)]
    pub allow_freeform: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputResponse {
    pub answer: String,
    #[serde(default)]
    pub was_freeform: bool,
}

#[derive(Debug, Clone)]
pub struct UserInputInvocation {
    pub session_id: String,
}

pub type UserInputHandler = Arc<
    dyn Fn(
            UserInputRequest,
            UserInputInvocation,
        ) -> BoxFuture<'static, Result<UserInputResponse, HandlerError>>
        + Send
        + Sync,
>;

// --- Hooks ---------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HookInvocation {
    pub session_id: String,
}

/// A hook handler: raw JSON input in, optional JSON output back.
pub type HookHandler = Arc<
    dyn Fn(Value, HookInvocation) -> BoxFuture<'static, Result<Option<Value>, HandlerError>>
        + Send
        + Sync,
>;

/// Hook handlers invoked by the server at session lifecycle points.
#[derive(Clone, Default)]
pub struct SessionHooks {
    pub on_pre_tool_use: Option<HookHandler>,
    pub on_post_tool_use: Option<HookHandler>,
    pub on_user_prompt_submitted: Option<HookHandler>,
    pub on_session_start: Option<HookHandler>,
    pub on_session_end: Option<HookHandler>,
    pub on_error_occurred: Option<HookHandler>,
}

impl SessionHooks {
    pub fn is_empty(&self) -> bool {
        self.on_pre_tool_use.is_none()
            && self.on_post_tool_use.is_none()
            && self.on_user_prompt_submitted.is_none()
            && self.on_session_start.is_none()
            && self.on_session_end.is_none()
            && self.on_error_occurred.is_none()
    }

    pub(crate) fn handler_for(&self, hook_type: &str) -> Option<HookHandler> {
        match hook_type {
            "preToolUse" => self.on_pre_tool_use.clone(),
            "postToolUse" => self.on_post_tool_use.clone(),
            "userPromptSubmitted" => self.on_user_prompt_submitted.clone(),
            "sessionStart" => self.on_session_start.clone(),
            "sessionEnd" => self.on_session_end.clone(),
            "errorOccurred" => self.on_error_occurred.clone(),
            _ => None,
        }
    }
}

impl std::fmt::Debug for SessionHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHooks").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(tool_name: &str) -> ToolInvocation {
        ToolInvocation {
            session_id: "s1".to_string(),
            tool_call_id: "tc1".to_string(),
            tool_name: tool_name.to_string(),
            arguments: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn missing_tool_yields_standard_failure() {
        let result = run_tool_call(None, invocation("missing_tool")).await;
        assert_eq!(result.result_type, "failure");
        assert_eq!(
            result.error.as_deref(),
            Some("tool 'missing_tool' not supported")
        );
    }

    #[tokio::test]
    async fn string_output_is_wrapped_as_success() {
        let tool = Tool::new("echo", "echoes", serde_json::json!({}), |inv| async move {
            Ok::<_, HandlerError>(format!("echo: {}", inv.arguments))
        });
        let result = run_tool_call(Some(tool.handler.clone()), invocation("echo")).await;
        assert_eq!(result.result_type, "success");
        assert!(result.text_result_for_llm.starts_with("echo:"));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn value_output_is_serialized() {
        let tool = Tool::new("nums", "", serde_json::json!({}), |_| async {
            Ok::<_, HandlerError>(serde_json::json!({"answer": 42}))
        });
        let result = run_tool_call(Some(tool.handler.clone()), invocation("nums")).await;
        assert_eq!(result.text_result_for_llm, r#"{"answer":42}"#);
    }

    #[tokio::test]
    async fn full_result_passes_through() {
        let tool = Tool::new("raw", "", serde_json::json!({}), |_| async {
            let mut result = ToolResult::success("done");
            result.session_log = Some("log line".to_string());
            Ok::<_, HandlerError>(result)
        });
        let result = run_tool_call(Some(tool.handler.clone()), invocation("raw")).await;
        assert_eq!(result.session_log.as_deref(), Some("log line"));
    }

    #[tokio::test]
    async fn handler_error_becomes_failure_envelope() {
        let tool = Tool::new("bad", "", serde_json::json!({}), |_| async {
            Err::<ToolOutput, HandlerError>("disk on fire".into())
        });
        let result = run_tool_call(Some(tool.handler.clone()), invocation("bad")).await;
        assert_eq!(result.result_type, "failure");
        assert_eq!(result.error.as_deref(), Some("disk on fire"));
        assert!(!result.text_result_for_llm.contains("disk on fire"));
    }

    #[tokio::test]
    async fn handler_panic_becomes_failure_envelope() {
        let tool = Tool::new("boom", "", serde_json::json!({}), |inv| async move {
            if inv.tool_call_id != "never" {
                panic!("unreachable state");
            }
            Ok::<ToolOutput, HandlerError>(ToolOutput::Text(String::new()))
        });
        let result = run_tool_call(Some(tool.handler.clone()), invocation("boom")).await;
        assert_eq!(result.result_type, "failure");
        assert!(result.error.unwrap().contains("panicked"));
    }

    #[test]
    fn tool_result_serializes_camel_case() {
        let json = serde_json::to_value(unsupported_tool_result("x")).unwrap();
        assert!(json.get("textResultForLlm").is_some());
        assert_eq!(json["resultType"], "failure");
        assert!(json.get("binaryResultsForLlm").is_none());
    }
}
