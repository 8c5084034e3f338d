//! Session handles and client-side session state.
//!
//! A [`Session`] is bound to one conversation id on one client. The client's
//! router dispatches inbound events into the session's shared state, which
//! buffers them (for history scans), fans them out to registered handlers,
//! and feeds a broadcast channel that completion waits subscribe to.

use crate::client::ClientInner;
use crate::dialect::Dialect;
use crate::error::{Error, Result};
use crate::events::{EventData, SessionEvent, last_turn_result};
use crate::options::{Attachment, MessageMode, MessageOptions};
use crate::protocol::next_request_id;
use crate::tools::{
    PermissionHandler, SessionHooks, Tool, ToolHandler, UserInputHandler,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Default bound for [`Session::send_and_wait`].
pub const DEFAULT_SEND_AND_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Under ACP a prompt call spans the whole turn rather than acking receipt.
const ACP_PROMPT_TIMEOUT: Duration = Duration::from_secs(600);

/// Event fan-out capacity; a waiter that lags this far behind drops events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

type EventHandler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// An explicit handle for a registered callback. Dropping it (or calling
/// [`unsubscribe`](Subscription::unsubscribe)) is the only way delivery
/// stops; deregistration is synchronous.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run();
    }
}

/// Client-side state for one session id, shared between the router (which
/// dispatches into it) and any number of [`Session`] handles.
pub(crate) struct SessionShared {
    session_id: String,
    workspace_path: Option<String>,
    dialect: Dialect,
    buffer: Mutex<Vec<SessionEvent>>,
    handlers: Mutex<HashMap<u64, EventHandler>>,
    next_handler_id: AtomicU64,
    events_tx: Mutex<broadcast::Sender<SessionEvent>>,
    tools: RwLock<HashMap<String, ToolHandler>>,
    permission_handler: Mutex<Option<PermissionHandler>>,
    user_input_handler: Mutex<Option<UserInputHandler>>,
    hooks: Mutex<Option<SessionHooks>>,
    /// Streamed assistant deltas for the current turn; used to synthesize a
    /// final assistant message when the dialect has no completion event.
    delta_accum: Mutex<String>,
}

impl SessionShared {
    pub(crate) fn new(
        session_id: String,
        workspace_path: Option<String>,
        dialect: Dialect,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            session_id,
            workspace_path,
            dialect,
            buffer: Mutex::new(Vec::new()),
            handlers: Mutex::new(HashMap::new()),
            next_handler_id: AtomicU64::new(1),
            events_tx: Mutex::new(events_tx),
            tools: RwLock::new(HashMap::new()),
            permission_handler: Mutex::new(None),
            user_input_handler: Mutex::new(None),
            hooks: Mutex::new(None),
            delta_accum: Mutex::new(String::new()),
        })
    }

    pub(crate) fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Deliver one inbound event: buffer it, wake waiters, run handlers.
    /// Handler panics are contained here; they never reach the reader task.
    pub(crate) fn dispatch_event(&self, event: SessionEvent) {
        if self.dialect == Dialect::Acp {
            match &event {
                SessionEvent::AssistantMessageDelta { data } => {
                    if let Some(delta) = &data.delta_content {
                        self.delta_accum.lock().unwrap().push_str(delta);
                    }
                }
                SessionEvent::UserMessage { .. } => {
                    self.delta_accum.lock().unwrap().clear();
                }
                _ => {}
            }
        }

        self.buffer.lock().unwrap().push(event.clone());
        let _ = self.events_tx.lock().unwrap().send(event.clone());

        let handlers: Vec<EventHandler> =
            self.handlers.lock().unwrap().values().cloned().collect();
        for handler in handlers {
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                warn!(
                    "session {} event handler panicked on {}",
                    self.session_id,
                    event.event_type()
                );
            }
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.lock().unwrap().subscribe()
    }

    pub(crate) fn buffered(&self) -> Vec<SessionEvent> {
        self.buffer.lock().unwrap().clone()
    }

    /// Close the live stream on connection loss. Existing receivers observe
    /// `Closed`; new subscriptions attach to a fresh channel so the session
    /// works again after a reconnect.
    pub(crate) fn close_stream(&self) {
        let (fresh, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        *self.events_tx.lock().unwrap() = fresh;
    }

    fn add_handler(&self, handler: EventHandler) -> u64 {
        let id = self.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.handlers.lock().unwrap().insert(id, handler);
        id
    }

    fn remove_handler(&self, id: u64) {
        self.handlers.lock().unwrap().remove(&id);
    }

    pub(crate) fn register_tools(&self, tools: &[Tool]) {
        let mut table = self.tools.write().unwrap();
        table.clear();
        for tool in tools {
            if tool.name.is_empty() {
                continue;
            }
            table.insert(tool.name.clone(), tool.handler.clone());
        }
    }

    pub(crate) fn tool_handler(&self, name: &str) -> Option<ToolHandler> {
        self.tools.read().unwrap().get(name).cloned()
    }

    pub(crate) fn set_permission_handler(&self, handler: Option<PermissionHandler>) {
        *self.permission_handler.lock().unwrap() = handler;
    }

    pub(crate) fn permission_handler(&self) -> Option<PermissionHandler> {
        self.permission_handler.lock().unwrap().clone()
    }

    pub(crate) fn set_user_input_handler(&self, handler: Option<UserInputHandler>) {
        *self.user_input_handler.lock().unwrap() = handler;
    }

    pub(crate) fn user_input_handler(&self) -> Option<UserInputHandler> {
        self.user_input_handler.lock().unwrap().clone()
    }

    pub(crate) fn set_hooks(&self, hooks: Option<SessionHooks>) {
        *self.hooks.lock().unwrap() = hooks;
    }

    pub(crate) fn hooks(&self) -> Option<SessionHooks> {
        self.hooks.lock().unwrap().clone()
    }

    pub(crate) fn clear_handlers(&self) {
        self.handlers.lock().unwrap().clear();
        self.tools.write().unwrap().clear();
        *self.permission_handler.lock().unwrap() = None;
        *self.user_input_handler.lock().unwrap() = None;
        *self.hooks.lock().unwrap() = None;
    }

    fn take_accumulated(&self) -> String {
        std::mem::take(&mut self.delta_accum.lock().unwrap())
    }
}

/// Registry of live sessions keyed by session id. Shared between the client
/// and each router instance, so sessions survive a supervised restart.
#[derive(Default)]
pub(crate) struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionShared>>>,
}

impl SessionRegistry {
    pub(crate) fn insert(&self, shared: Arc<SessionShared>) {
        self.sessions
            .write()
            .unwrap()
            .insert(shared.session_id().to_string(), shared);
    }

    pub(crate) fn get(&self, session_id: &str) -> Option<Arc<SessionShared>> {
        self.sessions.read().unwrap().get(session_id).cloned()
    }

    pub(crate) fn remove(&self, session_id: &str) -> Option<Arc<SessionShared>> {
        self.sessions.write().unwrap().remove(session_id)
    }

    pub(crate) fn drain(&self) -> Vec<Arc<SessionShared>> {
        self.sessions.write().unwrap().drain().map(|(_, s)| s).collect()
    }

    pub(crate) fn all(&self) -> Vec<Arc<SessionShared>> {
        self.sessions.read().unwrap().values().cloned().collect()
    }

    pub(crate) fn close_streams(&self) {
        for session in self.all() {
            session.close_stream();
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendRequestBody<'a> {
    session_id: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    attachments: &'a [Attachment],
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<MessageMode>,
}

/// A single conversation session with the Copilot CLI.
///
/// Created via [`CopilotClient::create_session`](crate::client::CopilotClient::create_session)
/// or resumed via
/// [`CopilotClient::resume_session`](crate::client::CopilotClient::resume_session);
/// meaningless detached from its client. All methods are safe for concurrent
/// use.
#[derive(Clone)]
pub struct Session {
    pub(crate) client: Arc<ClientInner>,
    pub(crate) shared: Arc<SessionShared>,
}

impl Session {
    /// The unique identifier for this session, stable across resume.
    pub fn session_id(&self) -> &str {
        self.shared.session_id()
    }

    /// Path to the session workspace directory when infinite sessions are
    /// enabled (contains checkpoints/, plan.md, and files/).
    pub fn workspace_path(&self) -> Option<&str> {
        self.shared.workspace_path.as_deref()
    }

    /// Send a prompt to this session.
    ///
    /// Returns the message id once the server acknowledges receipt; it does
    /// not wait for the assistant's response. Subscribe via [`Session::on`]
    /// or use [`Session::send_and_wait`] for completion.
    pub async fn send(&self, options: MessageOptions) -> Result<String> {
        match self.client.dialect() {
            Dialect::Native => {
                let body = SendRequestBody {
                    session_id: self.session_id(),
                    prompt: &options.prompt,
                    attachments: &options.attachments,
                    mode: options.mode,
                };
                let result = self
                    .client
                    .call("session.send", serde_json::to_value(&body)?)
                    .await?;
                result
                    .get("messageId")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .ok_or_else(|| {
                        Error::Protocol("session.send response missing messageId".into())
                    })
            }
            Dialect::Acp => self.send_acp(options).await,
        }
    }

    /// ACP prompts have no receipt ack; the `session/prompt` call spans the
    /// whole turn. Run it in the background and synthesize the user-message,
    /// final assistant-message, and idle events so the event model stays
    /// uniform across dialects.
    async fn send_acp(&self, options: MessageOptions) -> Result<String> {
        let message_id = format!("prompt-{}", next_request_id());

        self.shared.dispatch_event(SessionEvent::UserMessage {
            data: EventData {
                content: Some(Value::String(options.prompt.clone())),
                message_id: Some(message_id.clone()),
                ..Default::default()
            },
        });

        let params = serde_json::json!({
            "sessionId": self.session_id(),
            "prompt": options.prompt,
        });

        let client = Arc::clone(&self.client);
        let shared = Arc::clone(&self.shared);
        let id_for_task = message_id.clone();
        tokio::spawn(async move {
            match client
                .call_with_timeout("session.send", params, ACP_PROMPT_TIMEOUT)
                .await
            {
                Ok(_) => {
                    let content = shared.take_accumulated();
                    shared.dispatch_event(SessionEvent::AssistantMessage {
                        data: EventData {
                            content: Some(Value::String(content)),
                            message_id: Some(id_for_task),
                            ..Default::default()
                        },
                    });
                    shared.dispatch_event(SessionEvent::SessionIdle {
                        data: EventData::default(),
                    });
                }
                Err(e) => {
                    shared.dispatch_event(SessionEvent::SessionError {
                        data: EventData {
                            message: Some(Value::String(e.to_string())),
                            ..Default::default()
                        },
                    });
                }
            }
        });

        Ok(message_id)
    }

    /// Send a prompt and wait until the session reaches idle.
    ///
    /// Races a live subscription against a scan of already-buffered events,
    /// so a turn that completed before (or while) this call starts is found
    /// without a lost wakeup. Resolves with the final assistant message of
    /// the turn; rejects on a session error or when `timeout` (default 60s)
    /// elapses. The timeout bounds the wait only; it does not abort in-flight
    /// agent work.
    pub async fn send_and_wait(
        &self,
        options: MessageOptions,
        timeout: Option<Duration>,
    ) -> Result<Option<SessionEvent>> {
        let bound = timeout.unwrap_or(DEFAULT_SEND_AND_WAIT_TIMEOUT);

        // Subscribe before sending so nothing between the ack and our wait
        // can slip past unobserved.
        let mut rx = self.shared.subscribe();
        self.send(options).await?;

        let live = async {
            let mut last_assistant: Option<SessionEvent> = None;
            loop {
                match rx.recv().await {
                    Ok(event) => match &event {
                        SessionEvent::AssistantMessage { .. } => {
                            last_assistant = Some(event);
                        }
                        SessionEvent::SessionIdle { .. } => {
                            return match last_assistant.take() {
                                Some(event) => Ok(Some(event)),
                                None => Err(Error::Protocol(
                                    "session became idle without producing an assistant message"
                                        .into(),
                                )),
                            };
                        }
                        SessionEvent::SessionError { data } => {
                            return Err(Error::Session(
                                data.error_message()
                                    .unwrap_or("unknown session error")
                                    .to_string(),
                            ));
                        }
                        _ => {}
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("session event subscriber lagged; skipped {}", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(Error::ConnectionLost("event stream closed".into()));
                    }
                }
            }
        };

        let scan = async {
            let snapshot = self.shared.buffered();
            match last_turn_result(&snapshot) {
                Ok(Some(event)) => Ok(Some(event.clone())),
                Err(e) => Err(e),
                // Turn still in progress: let the live subscription win.
                Ok(None) => std::future::pending().await,
            }
        };

        tokio::time::timeout(bound, async {
            tokio::select! {
                result = live => result,
                result = scan => result,
            }
        })
        .await
        .map_err(|_| Error::Timeout(bound))?
    }

    /// Subscribe to events from this session.
    ///
    /// Handlers run synchronously in arrival order; a panicking handler is
    /// contained and logged. Delivery stops only when the returned
    /// [`Subscription`] is dropped or explicitly unsubscribed.
    pub fn on(&self, handler: impl Fn(&SessionEvent) + Send + Sync + 'static) -> Subscription {
        let id = self.shared.add_handler(Arc::new(handler));
        let shared = Arc::downgrade(&self.shared);
        Subscription::new(move || {
            if let Some(shared) = Weak::upgrade(&shared) {
                shared.remove_handler(id);
            }
        })
    }

    /// Full ordered event history for this session.
    ///
    /// Fetched from the server where the dialect allows it; otherwise the
    /// client-side buffer of live events is returned.
    pub async fn get_messages(&self) -> Result<Vec<SessionEvent>> {
        if !self.client.dialect().supports("session.getMessages") {
            return Ok(self.shared.buffered());
        }

        let result = self
            .client
            .call(
                "session.getMessages",
                serde_json::json!({"sessionId": self.session_id()}),
            )
            .await?;
        let events = result
            .get("events")
            .and_then(|e| e.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(events.into_iter().map(SessionEvent::from_value).collect())
    }

    /// Request cancellation of the in-flight turn. The session remains valid
    /// and eventually reaches idle or error.
    pub async fn abort(&self) -> Result<()> {
        self.client
            .call(
                "session.abort",
                serde_json::json!({"sessionId": self.session_id()}),
            )
            .await?;
        Ok(())
    }

    /// Destroy this session and release client-side resources.
    ///
    /// Server-side persisted state is not deleted; use
    /// [`CopilotClient::delete_session`](crate::client::CopilotClient::delete_session)
    /// for that. The session can be resumed later by id.
    pub async fn destroy(&self) -> Result<()> {
        let rpc_result = if self.client.dialect().supports("session.destroy") {
            self.client
                .call(
                    "session.destroy",
                    serde_json::json!({"sessionId": self.session_id()}),
                )
                .await
                .map(|_| ())
        } else {
            debug!(
                "session.destroy has no {} equivalent; releasing locally",
                self.client.dialect()
            );
            Ok(())
        };

        self.shared.clear_handlers();
        self.client.deregister_session(self.session_id());
        rpc_result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn shared() -> Arc<SessionShared> {
        SessionShared::new("s1".to_string(), None, Dialect::Native)
    }

    fn message(content: &str) -> SessionEvent {
        SessionEvent::AssistantMessage {
            data: EventData {
                content: Some(Value::String(content.to_string())),
                ..Default::default()
            },
        }
    }

    #[test]
    fn dispatch_buffers_and_calls_handlers() {
        let shared = shared();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        let id = shared.add_handler(Arc::new(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        }));

        shared.dispatch_event(message("one"));
        shared.dispatch_event(message("two"));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(shared.buffered().len(), 2);

        shared.remove_handler(id);
        shared.dispatch_event(message("three"));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(shared.buffered().len(), 3);
    }

    #[test]
    fn panicking_handler_does_not_stop_dispatch() {
        let shared = shared();
        let seen = Arc::new(AtomicUsize::new(0));
        shared.add_handler(Arc::new(|_| panic!("handler bug")));
        let seen_clone = Arc::clone(&seen);
        shared.add_handler(Arc::new(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        }));

        shared.dispatch_event(message("hello"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscribers_receive_dispatched_events() {
        let shared = shared();
        let mut rx = shared.subscribe();
        shared.dispatch_event(message("hi"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.content_text().as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn close_stream_closes_existing_receivers_only() {
        let shared = shared();
        let mut old_rx = shared.subscribe();
        shared.close_stream();
        assert!(matches!(
            old_rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));

        // Fresh subscriptions work again (reconnect case).
        let mut new_rx = shared.subscribe();
        shared.dispatch_event(message("back"));
        assert!(new_rx.recv().await.is_ok());
    }

    #[test]
    fn registry_add_get_remove() {
        let registry = SessionRegistry::default();
        registry.insert(shared());
        assert!(registry.get("s1").is_some());
        assert!(registry.get("s2").is_none());
        registry.remove("s1");
        assert!(registry.get("s1").is_none());
    }

    #[test]
    fn register_tools_skips_unnamed() {
        let shared = shared();
        shared.register_tools(&[Tool::new(
            "get_weather",
            "",
            serde_json::json!({}),
            |_| async { Ok::<_, crate::tools::HandlerError>("sunny") },
        )]);
        assert!(shared.tool_handler("get_weather").is_some());
        assert!(shared.tool_handler("missing_tool").is_none());
    }

    #[test]
    fn acp_accumulates_deltas_until_taken() {
        let shared = SessionShared::new("s1".to_string(), None, Dialect::Acp);
        shared.dispatch_event(SessionEvent::AssistantMessageDelta {
            data: EventData {
                delta_content: Some("Hel".to_string()),
                ..Default::default()
            },
        });
        shared.dispatch_event(SessionEvent::AssistantMessageDelta {
            data: EventData {
                delta_content: Some("lo".to_string()),
                ..Default::default()
            },
        });
        assert_eq!(shared.take_accumulated(), "Hello");
        assert_eq!(shared.take_accumulated(), "");
    }
}
