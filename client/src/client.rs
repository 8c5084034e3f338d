//! Client façade: connection lifecycle, session registry, and client-scoped
//! RPC operations.

use crate::dialect::Dialect;
use crate::error::{Error, Result};
use crate::options::{ClientOptions, ResolvedOptions, ResumeSessionConfig, SessionConfig};
use crate::process::{GRACEFUL_STOP_TIMEOUT, ProcessExit, spawn_cli_server};
use crate::router::{LifecycleRegistry, MessageRouter};
use crate::session::{Session, SessionRegistry, SessionShared, Subscription};
use crate::transport::Transport;
use crate::types::{
    ConnectionState, GetAuthStatusResponse, GetStatusResponse, ModelInfo, PingResponse,
    SessionLifecycleEvent, SessionLifecycleEventType, SessionMetadata,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Protocol version this SDK speaks; verified against the server on start.
pub const SDK_PROTOCOL_VERSION: u64 = 1;

/// Default bound for a single RPC call.
pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound for establishing the TCP connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A cleanup failure collected by [`CopilotClient::stop`].
#[derive(Debug, thiserror::Error)]
#[error("{context}: {source}")]
pub struct StopError {
    pub context: String,
    #[source]
    pub source: Error,
}

struct Connection {
    router: Arc<MessageRouter>,
    supervisor: Option<crate::process::ProcessSupervisor>,
}

pub(crate) struct ClientInner {
    options: ResolvedOptions,
    state: std::sync::RwLock<ConnectionState>,
    conn: std::sync::RwLock<Option<Connection>>,
    pub(crate) sessions: Arc<SessionRegistry>,
    lifecycle: Arc<LifecycleRegistry>,
    models_cache: tokio::sync::Mutex<Option<Vec<ModelInfo>>>,
    /// Serializes start/stop transitions.
    start_lock: tokio::sync::Mutex<()>,
    /// One automatic restart per crash; cleared by a successful start.
    restart_attempted: AtomicBool,
}

impl ClientInner {
    pub(crate) fn dialect(&self) -> Dialect {
        self.options.dialect
    }

    fn state(&self) -> ConnectionState {
        *self.state.read().unwrap()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write().unwrap() = state;
    }

    fn current_router(&self) -> Result<Arc<MessageRouter>> {
        self.conn
            .read()
            .unwrap()
            .as_ref()
            .map(|conn| Arc::clone(&conn.router))
            .ok_or(Error::NotConnected)
    }

    pub(crate) async fn call(&self, operation: &str, params: Value) -> Result<Value> {
        self.call_with_timeout(operation, params, DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    pub(crate) async fn call_with_timeout(
        &self,
        operation: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let router = self.current_router()?;
        router.call(operation, params, timeout).await
    }

    pub(crate) fn deregister_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    async fn ensure_connected(self: &Arc<Self>) -> Result<()> {
        if self.current_router().is_ok() {
            return Ok(());
        }
        if self.options.auto_start {
            self.start().await
        } else {
            Err(Error::NotConnected)
        }
    }

    async fn start(self: &Arc<Self>) -> Result<()> {
        let _guard = self.start_lock.lock().await;
        if self.state() == ConnectionState::Connected && self.current_router().is_ok() {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        match self.connect().await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                self.restart_attempted.store(false, Ordering::SeqCst);
                info!("copilot client connected");
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn connect(self: &Arc<Self>) -> Result<()> {
        let (transport, supervisor, exit_rx) = match &self.options.external {
            // An external endpoint is never spawned, only dialed.
            Some(endpoint) => {
                let transport = dial(&endpoint.host, endpoint.port).await?;
                (transport, None, None)
            }
            None => {
                let spawned = spawn_cli_server(&self.options).await?;
                match spawned.transport {
                    Some(transport) => {
                        (transport, Some(spawned.supervisor), Some(spawned.exit_rx))
                    }
                    None => {
                        let port = spawned.port.ok_or_else(|| {
                            Error::Protocol("spawned server reported no port".into())
                        })?;
                        let transport = dial("127.0.0.1", port).await?;
                        (transport, Some(spawned.supervisor), Some(spawned.exit_rx))
                    }
                }
            }
        };

        let router = MessageRouter::start(
            transport,
            self.options.dialect,
            Arc::clone(&self.sessions),
            Arc::clone(&self.lifecycle),
        );

        *self.conn.write().unwrap() = Some(Connection {
            router: Arc::clone(&router),
            supervisor,
        });

        if let Some(exit_rx) = exit_rx {
            self.watch_process_exit(exit_rx);
        }

        if let Err(e) = self.verify_protocol(&router).await {
            self.teardown_connection(true).await;
            return Err(e);
        }
        Ok(())
    }

    /// Handshake after connecting: ping under the native dialect (rejecting
    /// a protocol version mismatch), the `initialize` exchange under ACP.
    async fn verify_protocol(&self, router: &MessageRouter) -> Result<()> {
        match self.options.dialect {
            Dialect::Native => {
                let result = router
                    .call(
                        "ping",
                        serde_json::json!({"message": ""}),
                        DEFAULT_REQUEST_TIMEOUT,
                    )
                    .await?;
                let response: PingResponse = serde_json::from_value(result)?;
                match response.protocol_version {
                    None => Err(Error::Protocol(format!(
                        "SDK protocol version mismatch: SDK expects version \
                         {SDK_PROTOCOL_VERSION}, but the server does not report a protocol \
                         version. Update the server to ensure compatibility"
                    ))),
                    Some(version) if version != SDK_PROTOCOL_VERSION => {
                        Err(Error::Protocol(format!(
                            "SDK protocol version mismatch: SDK expects version \
                             {SDK_PROTOCOL_VERSION}, but the server reports version {version}. \
                             Update the SDK or the server to ensure compatibility"
                        )))
                    }
                    Some(_) => Ok(()),
                }
            }
            Dialect::Acp => {
                router
                    .call("ping", serde_json::json!({}), DEFAULT_REQUEST_TIMEOUT)
                    .await?;
                Ok(())
            }
        }
    }

    /// Watch for the supervised process exiting on its own. Pending calls
    /// are rejected by the reader observing EOF; this task handles state and
    /// the single automatic restart cycle.
    fn watch_process_exit(self: &Arc<Self>, exit_rx: oneshot::Receiver<ProcessExit>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            // RecvError means the supervisor handled a commanded stop.
            let Ok(exit) = exit_rx.await else { return };
            let Some(inner) = weak.upgrade() else { return };

            if matches!(
                inner.state(),
                ConnectionState::Stopping | ConnectionState::Disconnected
            ) {
                return;
            }

            warn!(
                "copilot CLI server exited unexpectedly (code {:?})",
                exit.code
            );
            let previous = inner.conn.write().unwrap().take();
            if let Some(conn) = previous {
                conn.router.shutdown().await;
            }
            inner.set_state(ConnectionState::Disconnected);

            if inner.options.auto_restart
                && !inner.restart_attempted.swap(true, Ordering::SeqCst)
            {
                info!("attempting automatic restart of the CLI server");
                match inner.start().await {
                    Ok(()) => info!("CLI server restarted"),
                    Err(e) => warn!("automatic restart failed: {}", e),
                }
            }
        });
    }

    /// Drop the connection; `force` kills the process immediately instead of
    /// granting the graceful shutdown window.
    async fn teardown_connection(&self, force: bool) {
        let conn = self.conn.write().unwrap().take();
        if let Some(conn) = conn {
            // Stop the process first: closing its pipes unblocks the reader.
            if let Some(supervisor) = &conn.supervisor {
                if force {
                    supervisor.kill().await;
                } else {
                    supervisor.stop(GRACEFUL_STOP_TIMEOUT).await;
                }
            }
            conn.router.shutdown().await;
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionCreatedResponse {
    session_id: String,
    #[serde(default)]
    workspace_path: Option<String>,
}

#[derive(Deserialize)]
struct AckResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

async fn dial(host: &str, port: u16) -> Result<Transport> {
    let address = format!("{host}:{port}");
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&address))
        .await
        .map_err(|_| Error::Timeout(CONNECT_TIMEOUT))?
        .map_err(|e| {
            Error::ConnectionLost(format!("failed to connect to CLI server at {address}: {e}"))
        })?;
    Ok(Transport::from_tcp(stream))
}

/// Client for the Copilot CLI server.
///
/// Owns the process supervisor, transport, router, and the registry of live
/// sessions. Either spawns a CLI server process or connects to an existing
/// one, then multiplexes any number of concurrent sessions over the single
/// connection.
///
/// ```no_run
/// # use copilot_client::{ClientOptions, CopilotClient, MessageOptions};
/// # async fn example() -> copilot_client::Result<()> {
/// let client = CopilotClient::new(ClientOptions::default())?;
/// client.start().await?;
///
/// let session = client.create_session(None).await?;
/// let reply = session
///     .send_and_wait(MessageOptions::prompt("What is 2+2?"), None)
///     .await?;
/// if let Some(event) = reply {
///     println!("{}", event.content_text().unwrap_or_default());
/// }
///
/// client.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CopilotClient {
    inner: Arc<ClientInner>,
}

impl CopilotClient {
    /// Validate options and build a client. No connection is attempted here;
    /// contradictory options (external endpoint plus spawn or auth options,
    /// malformed endpoint, out-of-range port) fail immediately.
    pub fn new(options: ClientOptions) -> Result<Self> {
        let options = options.resolve()?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                options,
                state: std::sync::RwLock::new(ConnectionState::Disconnected),
                conn: std::sync::RwLock::new(None),
                sessions: Arc::new(SessionRegistry::default()),
                lifecycle: Arc::new(LifecycleRegistry::default()),
                models_cache: tokio::sync::Mutex::new(None),
                start_lock: tokio::sync::Mutex::new(()),
                restart_attempted: AtomicBool::new(false),
            }),
        })
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Start the CLI server (unless an external endpoint was configured) and
    /// establish the connection. Idempotent while connected; called
    /// automatically on first use when `auto_start` is enabled.
    pub async fn start(&self) -> Result<()> {
        self.inner.start().await
    }

    /// Graceful shutdown: destroy sessions, stop the process, close the
    /// transport. Partial failures are collected and returned rather than
    /// aborting the teardown sequence.
    pub async fn stop(&self) -> Vec<StopError> {
        let _guard = self.inner.start_lock.lock().await;
        self.inner.set_state(ConnectionState::Stopping);
        let mut errors = Vec::new();

        let can_destroy = self.inner.dialect().supports("session.destroy")
            && self.inner.current_router().is_ok();
        for shared in self.inner.sessions.drain() {
            if can_destroy {
                let params = serde_json::json!({"sessionId": shared.session_id()});
                if let Err(e) = self.inner.call("session.destroy", params).await {
                    errors.push(StopError {
                        context: format!("failed to destroy session {}", shared.session_id()),
                        source: e,
                    });
                }
            }
            shared.clear_handlers();
        }

        self.inner.teardown_connection(false).await;
        *self.inner.models_cache.lock().await = None;
        self.inner.set_state(ConnectionState::Disconnected);
        errors
    }

    /// Forceful shutdown: clears sessions without destroying them, kills the
    /// process, and always reaches `Disconnected`. Idempotent, never fails.
    pub async fn force_stop(&self) {
        self.inner.set_state(ConnectionState::Stopping);
        for shared in self.inner.sessions.drain() {
            shared.clear_handlers();
        }
        self.inner.teardown_connection(true).await;
        *self.inner.models_cache.lock().await = None;
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Create a new conversation session.
    pub async fn create_session(&self, config: Option<SessionConfig>) -> Result<Session> {
        self.inner.ensure_connected().await?;
        let config = config.unwrap_or_default();

        let result = self
            .inner
            .call("session.create", config.to_request())
            .await?;
        let response: SessionCreatedResponse = serde_json::from_value(result)?;

        let shared = SessionShared::new(
            response.session_id,
            response.workspace_path,
            self.inner.dialect(),
        );
        shared.register_tools(&config.tools);
        shared.set_permission_handler(config.on_permission_request.clone());
        shared.set_user_input_handler(config.on_user_input_request.clone());
        shared.set_hooks(config.hooks.clone());
        self.inner.sessions.insert(Arc::clone(&shared));

        Ok(Session {
            client: Arc::clone(&self.inner),
            shared,
        })
    }

    /// Resume a previously created session by id with default options.
    pub async fn resume_session(&self, session_id: &str) -> Result<Session> {
        self.resume_session_with_options(session_id, ResumeSessionConfig::default())
            .await
    }

    /// Resume a previously created session, optionally re-registering tools
    /// and handlers or changing the model.
    pub async fn resume_session_with_options(
        &self,
        session_id: &str,
        config: ResumeSessionConfig,
    ) -> Result<Session> {
        self.inner.ensure_connected().await?;

        let result = self
            .inner
            .call("session.resume", config.to_request(session_id))
            .await?;
        let response: SessionCreatedResponse = serde_json::from_value(result)?;

        let shared = SessionShared::new(
            response.session_id,
            response.workspace_path,
            self.inner.dialect(),
        );
        shared.register_tools(&config.tools);
        shared.set_permission_handler(config.on_permission_request.clone());
        shared.set_user_input_handler(config.on_user_input_request.clone());
        shared.set_hooks(config.hooks.clone());
        self.inner.sessions.insert(Arc::clone(&shared));

        Ok(Session {
            client: Arc::clone(&self.inner),
            shared,
        })
    }

    /// Metadata for all sessions known to the server.
    pub async fn list_sessions(&self) -> Result<Vec<SessionMetadata>> {
        self.inner.ensure_connected().await?;
        let result = self
            .inner
            .call("session.list", serde_json::json!({}))
            .await?;

        #[derive(Deserialize)]
        struct ListSessionsResponse {
            #[serde(default)]
            sessions: Vec<SessionMetadata>,
        }
        let response: ListSessionsResponse = serde_json::from_value(result)?;
        Ok(response.sessions)
    }

    /// Permanently delete a session and its conversation history server-side.
    /// The session cannot be resumed afterwards.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.inner.ensure_connected().await?;
        let result = self
            .inner
            .call(
                "session.delete",
                serde_json::json!({"sessionId": session_id}),
            )
            .await?;

        let response: AckResponse = serde_json::from_value(result)?;
        if !response.success {
            return Err(Error::Protocol(format!(
                "failed to delete session {session_id}: {}",
                response.error.as_deref().unwrap_or("unknown error")
            )));
        }
        self.inner.sessions.remove(session_id);
        Ok(())
    }

    /// Id of the session currently displayed in the TUI, when the server
    /// runs in TUI+server mode.
    pub async fn get_foreground_session_id(&self) -> Result<Option<String>> {
        self.inner.ensure_connected().await?;
        let result = self
            .inner
            .call("session.getForeground", serde_json::json!({}))
            .await?;
        Ok(result
            .get("sessionId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()))
    }

    /// Ask the TUI to switch to the given session (TUI+server mode).
    pub async fn set_foreground_session_id(&self, session_id: &str) -> Result<()> {
        self.inner.ensure_connected().await?;
        let result = self
            .inner
            .call(
                "session.setForeground",
                serde_json::json!({"sessionId": session_id}),
            )
            .await?;

        let response: AckResponse = serde_json::from_value(result)?;
        if !response.success {
            return Err(Error::Protocol(format!(
                "failed to set foreground session: {}",
                response.error.as_deref().unwrap_or("unknown error")
            )));
        }
        Ok(())
    }

    /// Liveness probe. The optional message is echoed back.
    pub async fn ping(&self, message: Option<&str>) -> Result<PingResponse> {
        let result = self
            .inner
            .call(
                "ping",
                serde_json::json!({"message": message.unwrap_or("")}),
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// CLI version and protocol information.
    pub async fn get_status(&self) -> Result<GetStatusResponse> {
        let result = self
            .inner
            .call("status.get", serde_json::json!({}))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Current authentication status.
    pub async fn get_auth_status(&self) -> Result<GetAuthStatusResponse> {
        let result = self
            .inner
            .call("auth.getStatus", serde_json::json!({}))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Available models with metadata. Cached after the first successful
    /// call; the cache is cleared on stop.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let mut cache = self.inner.models_cache.lock().await;
        if let Some(models) = cache.as_ref() {
            return Ok(models.clone());
        }

        let result = self
            .inner
            .call("models.list", serde_json::json!({}))
            .await?;

        #[derive(Deserialize)]
        struct ListModelsResponse {
            #[serde(default)]
            models: Vec<ModelInfo>,
        }
        let response: ListModelsResponse = serde_json::from_value(result)?;
        *cache = Some(response.models.clone());
        Ok(response.models)
    }

    /// Send a protocol-agnostic notification: fire-and-forget, no id, no
    /// response. The operation name is translated to the active dialect the
    /// same way calls are.
    pub async fn notify(&self, operation: &str, params: Value) -> Result<()> {
        let router = self.inner.current_router()?;
        router.notify(operation, params).await
    }

    /// Subscribe to all session lifecycle events. Delivery stops when the
    /// returned [`Subscription`] is released.
    pub fn on(
        &self,
        handler: impl Fn(&SessionLifecycleEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.lifecycle.add(Arc::new(handler));
        let lifecycle = Arc::downgrade(&self.inner.lifecycle);
        Subscription::new(move || {
            if let Some(lifecycle) = lifecycle.upgrade() {
                lifecycle.remove(id);
            }
        })
    }

    /// Subscribe to one lifecycle event type only.
    pub fn on_event_type(
        &self,
        event_type: SessionLifecycleEventType,
        handler: impl Fn(&SessionLifecycleEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.on(move |event| {
            if event.event_type == event_type {
                handler(event);
            }
        })
    }
}

impl std::fmt::Debug for CopilotClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopilotClient")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
