//! Client and session configuration.
//!
//! All contradictory-option checks happen here, synchronously, before any
//! process is spawned or connection attempted.

use crate::dialect::Dialect;
use crate::error::{Error, Result};
use crate::tools::{PermissionHandler, SessionHooks, Tool, ToolDefinition, UserInputHandler};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;

/// Configures a [`CopilotClient`](crate::client::CopilotClient).
///
/// The default configuration spawns a CLI server over stdio, auto-starts on
/// first use, and authenticates as the logged-in user.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Path to the Copilot CLI executable. When unset, the
    /// `COPILOT_CLI_PATH` environment variable, then `copilot` on PATH, are
    /// tried in order.
    pub cli_path: Option<PathBuf>,
    /// Working directory for the CLI process (default: inherit).
    pub cwd: Option<PathBuf>,
    /// Fixed port for TCP transport. Unset with `use_stdio = false` lets the
    /// server pick a random port. Setting a port switches to TCP mode.
    pub port: Option<u16>,
    /// Use stdio transport instead of TCP (default: true).
    pub use_stdio: Option<bool>,
    /// URL of an existing CLI server to connect to over TCP. Formats:
    /// `"host:port"`, `"http://host:port"`, `"https://host:port"`, or just
    /// `"port"` (host defaults to localhost). Mutually exclusive with
    /// `cli_path`, `use_stdio`, and `port`.
    pub cli_url: Option<String>,
    /// Log level passed to the CLI server (default: "info").
    pub log_level: Option<String>,
    /// Start the CLI server automatically on first use (default: true).
    pub auto_start: Option<bool>,
    /// Restart the CLI server once if it crashes (default: true).
    pub auto_restart: Option<bool>,
    /// Environment for the CLI process (default: inherit).
    pub env: Option<HashMap<String, String>>,
    /// GitHub token for authentication, passed to the server via environment
    /// variable. Mutually exclusive with `cli_url`.
    pub github_token: Option<String>,
    /// Authenticate as the already-logged-in user (default: true, flipped to
    /// false when `github_token` is supplied unless explicitly set).
    pub use_logged_in_user: Option<bool>,
    /// Wire dialect (default: native).
    pub dialect: Option<Dialect>,
}

/// A parsed external server endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

/// Parse a CLI URL into host and port.
///
/// Accepts `host:port`, `http://host:port`, `https://host:port`, and a bare
/// `port` (host defaults to localhost).
pub fn parse_cli_url(url: &str) -> Result<Endpoint> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);

    let (host, port_str) = match rest.split_once(':') {
        Some((host, port)) => (host, port),
        None => ("", rest),
    };
    let host = if host.is_empty() { "localhost" } else { host };

    let port: i64 = port_str
        .trim()
        .parse()
        .map_err(|_| Error::Configuration(format!("invalid cli_url format: '{url}'")))?;
    if !(1..=65535).contains(&port) {
        return Err(Error::Configuration(format!(
            "port out of range in cli_url: '{url}' (expected 1-65535)"
        )));
    }

    Ok(Endpoint {
        host: host.to_string(),
        port: port as u16,
    })
}

/// Options after validation and default resolution.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedOptions {
    pub cli_path: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
    pub port: Option<u16>,
    pub use_stdio: bool,
    pub external: Option<Endpoint>,
    pub log_level: String,
    pub auto_start: bool,
    pub auto_restart: bool,
    pub env: Option<HashMap<String, String>>,
    pub github_token: Option<String>,
    pub use_logged_in_user: bool,
    pub dialect: Dialect,
}

impl ClientOptions {
    pub(crate) fn resolve(self) -> Result<ResolvedOptions> {
        if self.cli_url.is_some() {
            if self.use_stdio.is_some() || self.cli_path.is_some() || self.port.is_some() {
                return Err(Error::Configuration(
                    "cli_url is mutually exclusive with use_stdio, cli_path, and port".into(),
                ));
            }
            if self.github_token.is_some() || self.use_logged_in_user.is_some() {
                return Err(Error::Configuration(
                    "github_token and use_logged_in_user cannot be used with cli_url \
                     (an external server manages its own auth)"
                        .into(),
                ));
            }
        }

        if self.port == Some(0) {
            return Err(Error::Configuration(
                "port out of range: 0 (expected 1-65535)".into(),
            ));
        }

        let external = match self.cli_url.as_deref() {
            Some(url) => Some(parse_cli_url(url)?),
            None => None,
        };

        let use_stdio = if external.is_some() {
            false
        } else {
            match (self.use_stdio, self.port) {
                (Some(explicit), _) => explicit,
                (None, Some(_)) => false,
                (None, None) => true,
            }
        };

        let use_logged_in_user = self
            .use_logged_in_user
            .unwrap_or(self.github_token.is_none());

        Ok(ResolvedOptions {
            cli_path: self.cli_path,
            cwd: self.cwd,
            port: self.port,
            use_stdio,
            external,
            log_level: self.log_level.unwrap_or_else(|| "info".to_string()),
            auto_start: self.auto_start.unwrap_or(true),
            auto_restart: self.auto_restart.unwrap_or(true),
            env: self.env,
            github_token: self.github_token,
            use_logged_in_user,
            dialect: self.dialect.unwrap_or_default(),
        })
    }
}

/// System message customization for a session. `mode` is "append" (default)
/// or "replace"; replace removes all server-managed guardrails.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMessageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Infinite sessions: workspace persistence plus automatic context
/// compaction. The client only consumes the resulting workspace path.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfiniteSessionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Context utilization (0.0-1.0) at which background compaction starts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background_compaction_threshold: Option<f64>,
    /// Context utilization (0.0-1.0) at which the session blocks until
    /// compaction completes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer_exhaustion_threshold: Option<f64>,
}

/// Configures a new session.
#[derive(Clone, Default)]
pub struct SessionConfig {
    /// Optional caller-supplied session id; stable across resume.
    pub session_id: Option<String>,
    pub model: Option<String>,
    /// "low", "medium", "high", or "xhigh"; only for models that support it.
    pub reasoning_effort: Option<String>,
    pub config_dir: Option<PathBuf>,
    /// Caller-implemented tools exposed to the CLI.
    pub tools: Vec<Tool>,
    pub system_message: Option<SystemMessageConfig>,
    /// Allow-list of tool names; takes precedence over `excluded_tools`.
    pub available_tools: Option<Vec<String>>,
    pub excluded_tools: Option<Vec<String>>,
    pub on_permission_request: Option<PermissionHandler>,
    pub on_user_input_request: Option<UserInputHandler>,
    pub hooks: Option<SessionHooks>,
    pub working_directory: Option<PathBuf>,
    /// Emit `assistant.message.delta` / `assistant.reasoning.delta` events as
    /// the response is generated.
    pub streaming: bool,
    /// Custom model provider configuration (BYOK), in wire shape.
    pub provider: Option<Value>,
    /// MCP server configurations keyed by name, in wire shape.
    pub mcp_servers: Option<Value>,
    pub custom_agents: Option<Value>,
    pub skill_directories: Option<Vec<String>>,
    pub disabled_skills: Option<Vec<String>>,
    pub infinite_sessions: Option<InfiniteSessionConfig>,
}

/// Configures resuming an existing session.
#[derive(Clone, Default)]
pub struct ResumeSessionConfig {
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub config_dir: Option<PathBuf>,
    pub tools: Vec<Tool>,
    pub system_message: Option<SystemMessageConfig>,
    pub available_tools: Option<Vec<String>>,
    pub excluded_tools: Option<Vec<String>>,
    pub on_permission_request: Option<PermissionHandler>,
    pub on_user_input_request: Option<UserInputHandler>,
    pub hooks: Option<SessionHooks>,
    pub working_directory: Option<PathBuf>,
    pub streaming: bool,
    pub provider: Option<Value>,
    pub mcp_servers: Option<Value>,
    pub custom_agents: Option<Value>,
    pub skill_directories: Option<Vec<String>>,
    pub disabled_skills: Option<Vec<String>>,
    pub infinite_sessions: Option<InfiniteSessionConfig>,
    /// Skip emitting the session.resume event server-side; useful for
    /// reconnecting without resume side effects.
    pub disable_resume: bool,
}

/// Wire body shared by `session.create` and `session.resume`.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionRequestBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    config_dir: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_message: Option<SystemMessageConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    available_tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    excluded_tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    working_directory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    streaming: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_permission: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_user_input: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hooks: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<Value>,
    #[serde(rename = "mcpServers", skip_serializing_if = "Option::is_none")]
    mcp_servers: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    custom_agents: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    skill_directories: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    disabled_skills: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    infinite_sessions: Option<InfiniteSessionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    disable_resume: Option<bool>,
}

fn flag(enabled: bool) -> Option<bool> {
    enabled.then_some(true)
}

impl SessionConfig {
    pub(crate) fn to_request(&self) -> Value {
        let body = SessionRequestBody {
            session_id: self.session_id.clone(),
            model: self.model.clone(),
            reasoning_effort: self.reasoning_effort.clone(),
            config_dir: self
                .config_dir
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            tools: self.tools.iter().map(ToolDefinition::from).collect(),
            system_message: self.system_message.clone(),
            available_tools: self.available_tools.clone(),
            excluded_tools: self.excluded_tools.clone(),
            working_directory: self
                .working_directory
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            streaming: flag(self.streaming),
            request_permission: flag(self.on_permission_request.is_some()),
            request_user_input: flag(self.on_user_input_request.is_some()),
            hooks: flag(self.hooks.as_ref().is_some_and(|h| !h.is_empty())),
            provider: self.provider.clone(),
            mcp_servers: self.mcp_servers.clone(),
            custom_agents: self.custom_agents.clone(),
            skill_directories: self.skill_directories.clone(),
            disabled_skills: self.disabled_skills.clone(),
            infinite_sessions: self.infinite_sessions.clone(),
            disable_resume: None,
        };
        serde_json::to_value(body).unwrap_or(Value::Null)
    }
}

impl ResumeSessionConfig {
    pub(crate) fn to_request(&self, session_id: &str) -> Value {
        let body = SessionRequestBody {
            session_id: Some(session_id.to_string()),
            model: self.model.clone(),
            reasoning_effort: self.reasoning_effort.clone(),
            config_dir: self
                .config_dir
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            tools: self.tools.iter().map(ToolDefinition::from).collect(),
            system_message: self.system_message.clone(),
            available_tools: self.available_tools.clone(),
            excluded_tools: self.excluded_tools.clone(),
            working_directory: self
                .working_directory
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            streaming: flag(self.streaming),
            request_permission: flag(self.on_permission_request.is_some()),
            request_user_input: flag(self.on_user_input_request.is_some()),
            hooks: flag(self.hooks.as_ref().is_some_and(|h| !h.is_empty())),
            provider: self.provider.clone(),
            mcp_servers: self.mcp_servers.clone(),
            custom_agents: self.custom_agents.clone(),
            skill_directories: self.skill_directories.clone(),
            disabled_skills: self.disabled_skills.clone(),
            infinite_sessions: self.infinite_sessions.clone(),
            disable_resume: flag(self.disable_resume),
        };
        serde_json::to_value(body).unwrap_or(Value::Null)
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("session_id", &self.session_id)
            .field("model", &self.model)
            .field("tools", &self.tools.len())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for ResumeSessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumeSessionConfig")
            .field("model", &self.model)
            .field("tools", &self.tools.len())
            .finish_non_exhaustive()
    }
}

/// File or directory attachment for a message.
#[derive(Debug, Clone, Serialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
}

/// Delivery mode for a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageMode {
    /// Queue behind in-flight work (default).
    Enqueue,
    /// Interrupt in-flight work.
    Immediate,
}

/// A message to send to a session.
#[derive(Debug, Clone, Default)]
pub struct MessageOptions {
    pub prompt: String,
    pub attachments: Vec<Attachment>,
    pub mode: Option<MessageMode>,
}

impl MessageOptions {
    pub fn prompt(text: impl Into<String>) -> Self {
        Self {
            prompt: text.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_port_only_url() {
        let endpoint = parse_cli_url("8080").unwrap();
        assert_eq!(endpoint, Endpoint { host: "localhost".into(), port: 8080 });
    }

    #[test]
    fn parses_host_port_url() {
        let endpoint = parse_cli_url("127.0.0.1:9000").unwrap();
        assert_eq!(endpoint, Endpoint { host: "127.0.0.1".into(), port: 9000 });
    }

    #[test]
    fn parses_http_url() {
        let endpoint = parse_cli_url("http://localhost:7000").unwrap();
        assert_eq!(endpoint, Endpoint { host: "localhost".into(), port: 7000 });
    }

    #[test]
    fn parses_https_url() {
        let endpoint = parse_cli_url("https://example.com:443").unwrap();
        assert_eq!(endpoint, Endpoint { host: "example.com".into(), port: 443 });
    }

    #[test]
    fn rejects_invalid_url_format() {
        let err = parse_cli_url("invalid-url").unwrap_err();
        assert!(err.to_string().contains("invalid cli_url format"));
    }

    #[test]
    fn rejects_out_of_range_ports() {
        for url in ["localhost:99999", "localhost:0", "localhost:-1"] {
            let err = parse_cli_url(url).unwrap_err();
            assert!(
                err.to_string().contains("port out of range"),
                "expected range error for {url}, got: {err}"
            );
        }
    }

    #[test]
    fn cli_url_is_exclusive_with_spawn_options() {
        for options in [
            ClientOptions {
                cli_url: Some("localhost:8080".into()),
                use_stdio: Some(true),
                ..Default::default()
            },
            ClientOptions {
                cli_url: Some("localhost:8080".into()),
                cli_path: Some("/path/to/cli".into()),
                ..Default::default()
            },
            ClientOptions {
                cli_url: Some("localhost:8080".into()),
                port: Some(9000),
                ..Default::default()
            },
        ] {
            let err = options.resolve().unwrap_err();
            assert!(matches!(err, Error::Configuration(_)));
            assert!(err.to_string().contains("mutually exclusive"));
        }
    }

    #[test]
    fn cli_url_is_exclusive_with_auth_options() {
        for options in [
            ClientOptions {
                cli_url: Some("localhost:8080".into()),
                github_token: Some("gho_test_token".into()),
                ..Default::default()
            },
            ClientOptions {
                cli_url: Some("localhost:8080".into()),
                use_logged_in_user: Some(false),
                ..Default::default()
            },
        ] {
            let err = options.resolve().unwrap_err();
            assert!(err.to_string().contains("cli_url"));
        }
    }

    #[test]
    fn cli_url_switches_off_stdio() {
        let resolved = ClientOptions {
            cli_url: Some("8080".into()),
            ..Default::default()
        }
        .resolve()
        .unwrap();
        assert!(!resolved.use_stdio);
        assert_eq!(
            resolved.external,
            Some(Endpoint { host: "localhost".into(), port: 8080 })
        );
    }

    #[test]
    fn stdio_defaults_on_and_port_switches_to_tcp() {
        assert!(ClientOptions::default().resolve().unwrap().use_stdio);

        let tcp = ClientOptions {
            port: Some(9000),
            ..Default::default()
        }
        .resolve()
        .unwrap();
        assert!(!tcp.use_stdio);

        let explicit = ClientOptions {
            use_stdio: Some(false),
            ..Default::default()
        }
        .resolve()
        .unwrap();
        assert!(!explicit.use_stdio);
    }

    #[test]
    fn rejects_zero_port() {
        let err = ClientOptions {
            port: Some(0),
            ..Default::default()
        }
        .resolve()
        .unwrap_err();
        assert!(err.to_string().contains("port out of range"));
    }

    #[test]
    fn logged_in_user_defaults_follow_token() {
        // No token: defaults true.
        assert!(ClientOptions::default().resolve().unwrap().use_logged_in_user);

        // Token flips the default to false.
        let with_token = ClientOptions {
            github_token: Some("gho_test_token".into()),
            ..Default::default()
        }
        .resolve()
        .unwrap();
        assert!(!with_token.use_logged_in_user);

        // Explicit true wins over the token-derived default.
        let explicit = ClientOptions {
            github_token: Some("gho_test_token".into()),
            use_logged_in_user: Some(true),
            ..Default::default()
        }
        .resolve()
        .unwrap();
        assert!(explicit.use_logged_in_user);
    }

    #[test]
    fn session_request_derives_capability_flags() {
        let config = SessionConfig {
            model: Some("gpt-5".into()),
            streaming: true,
            tools: vec![Tool::new(
                "get_weather",
                "Get weather for a location",
                serde_json::json!({"type": "object"}),
                |_| async { Ok::<_, crate::tools::HandlerError>("sunny") },
            )],
            ..Default::default()
        };
        let body = config.to_request();
        assert_eq!(body["model"], "gpt-5");
        assert_eq!(body["streaming"], true);
        assert_eq!(body["tools"][0]["name"], "get_weather");
        assert!(body.get("requestPermission").is_none());
        assert!(body.get("sessionId").is_none());
    }

    #[test]
    fn resume_request_carries_session_id_and_disable_resume() {
        let config = ResumeSessionConfig {
            disable_resume: true,
            ..Default::default()
        };
        let body = config.to_request("session-123");
        assert_eq!(body["sessionId"], "session-123");
        assert_eq!(body["disableResume"], true);
    }
}
