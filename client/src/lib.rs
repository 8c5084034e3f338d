//! Client SDK for the GitHub Copilot CLI.
//!
//! Drives a `copilot` process in server mode (or an already-running server)
//! over JSON-RPC 2.0: typed sessions, streaming events, and bidirectional
//! tool invocation, multiplexed over a single stdio or TCP connection.
//!
//! ```no_run
//! use copilot_client::{ClientOptions, CopilotClient, MessageOptions};
//!
//! # async fn run() -> copilot_client::Result<()> {
//! let client = CopilotClient::new(ClientOptions::default())?;
//! let session = client.create_session(None).await?;
//!
//! let reply = session
//!     .send_and_wait(MessageOptions::prompt("Hello!"), None)
//!     .await?;
//! if let Some(event) = reply {
//!     println!("{}", event.content_text().unwrap_or_default());
//! }
//!
//! client.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod dialect;
pub mod error;
pub mod events;
pub mod options;
mod process;
pub mod protocol;
mod router;
pub mod session;
pub mod tools;
mod transport;
pub mod types;

// Re-export commonly used types
pub use client::{CopilotClient, SDK_PROTOCOL_VERSION, StopError};
pub use dialect::{ACP_PROTOCOL_VERSION, Dialect};
pub use error::{Error, Result};
pub use events::{EventData, SessionEvent, last_turn_result};
pub use options::{
    Attachment, ClientOptions, Endpoint, InfiniteSessionConfig, MessageMode, MessageOptions,
    ResumeSessionConfig, SessionConfig, SystemMessageConfig, parse_cli_url,
};
pub use session::{DEFAULT_SEND_AND_WAIT_TIMEOUT, Session, Subscription};
pub use tools::{
    HandlerError, HookHandler, HookInvocation, PermissionHandler, PermissionInvocation,
    PermissionRequest, PermissionRequestResult, SessionHooks, Tool, ToolBinaryResult,
    ToolDefinition, ToolHandler, ToolInvocation, ToolOutput, ToolResult, UserInputHandler,
    UserInputInvocation, UserInputRequest, UserInputResponse,
};
pub use types::{
    ConnectionState, GetAuthStatusResponse, GetStatusResponse, ModelBilling, ModelCapabilities,
    ModelInfo, ModelLimits, ModelPolicy, ModelSupports, PingResponse, SessionLifecycleEvent,
    SessionLifecycleEventMetadata, SessionLifecycleEventType, SessionMetadata,
};
