//! Message router: request/response correlation and inbound dispatch.
//!
//! One router per live connection. A single background reader task owns the
//! transport's read half and classifies every frame:
//!
//! - **Responses** resolve the matching entry in the pending-request table.
//! - **Server-initiated requests** (`tool.call`, `permission.request`,
//!   `userInput.request`, `hooks.invoke`) are answered from a spawned task so
//!   a slow handler cannot stall delivery of other sessions' events.
//! - **Notifications** are reshaped by the dialect and routed to the owning
//!   session or the client's lifecycle listeners.
//!
//! When the reader ends (EOF, I/O error, or shutdown) every pending request
//! is rejected with a connection-lost error and session event streams are
//! closed.

use crate::dialect::{Dialect, InboundEvent, translate_notification};
use crate::error::{Error, Result};
use crate::protocol::{
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, JsonRpcResponseOut, MessageKind,
    classify_message,
};
use crate::session::SessionRegistry;
use crate::tools::{
    PermissionInvocation, PermissionRequest, PermissionRequestResult, ToolInvocation,
    UserInputInvocation, UserInputRequest, run_tool_call,
};
use crate::transport::{FramedReader, FramedWriter, Transport};
use crate::types::SessionLifecycleEvent;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

/// Callback for client-scoped session lifecycle notifications.
pub(crate) type LifecycleHandler = Arc<dyn Fn(&SessionLifecycleEvent) + Send + Sync>;

/// Registered lifecycle listeners, shared across router instances.
#[derive(Default)]
pub(crate) struct LifecycleRegistry {
    handlers: std::sync::RwLock<HashMap<u64, LifecycleHandler>>,
    next_id: AtomicU64,
}

impl LifecycleRegistry {
    pub(crate) fn add(&self, handler: LifecycleHandler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handlers.write().unwrap().insert(id, handler);
        id
    }

    pub(crate) fn remove(&self, id: u64) {
        self.handlers.write().unwrap().remove(&id);
    }

    pub(crate) fn dispatch(&self, event: &SessionLifecycleEvent) {
        let handlers: Vec<LifecycleHandler> =
            self.handlers.read().unwrap().values().cloned().collect();
        for handler in handlers {
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!("lifecycle handler panicked on {:?}", event.event_type);
            }
        }
    }
}

type PendingTable = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Correlates requests with responses over one connection and routes
/// everything else.
pub(crate) struct MessageRouter {
    dialect: Dialect,
    writer: Arc<FramedWriter>,
    pending: PendingTable,
    connected: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
}

impl MessageRouter {
    /// Take ownership of a connected transport and start the reader task.
    pub(crate) fn start(
        transport: Transport,
        dialect: Dialect,
        sessions: Arc<SessionRegistry>,
        lifecycle: Arc<LifecycleRegistry>,
    ) -> Arc<Self> {
        let writer = Arc::new(transport.writer);
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        let reader_task = tokio::spawn(reader_loop(
            transport.reader,
            dialect,
            Arc::clone(&writer),
            Arc::clone(&pending),
            Arc::clone(&connected),
            sessions,
            lifecycle,
        ));

        Arc::new(Self {
            dialect,
            writer,
            pending,
            connected,
            reader_task,
        })
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send a request and await its correlated response.
    ///
    /// The operation name is translated to the active dialect first; an
    /// operation the dialect cannot express fails here, before any wire
    /// traffic. On timeout the pending entry is discarded and a late
    /// response for that id is ignored.
    pub(crate) async fn call(
        &self,
        operation: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let method = self.dialect.wire_method(operation)?;
        let params = self.dialect.translate_params(operation, params);

        if !self.is_connected() {
            return Err(Error::ConnectionLost("connection closed".into()));
        }

        let request = JsonRpcRequest::new(method, Some(params));
        let request_id = request.id;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);
        debug!("sending request {} method={}", request_id, method);

        if let Err(e) = self.writer.write_message(&request).await {
            self.pending.lock().await.remove(&request_id);
            return Err(e);
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(Error::ConnectionLost(
                    "connection closed while awaiting response".into(),
                ));
            }
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                debug!(
                    "request {} timed out; a late response will be ignored",
                    request_id
                );
                return Err(Error::Timeout(timeout));
            }
        };

        if let Some(err) = response.error {
            return Err(Error::Rpc {
                code: err.code,
                message: err.message,
                data: err.data,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Fire-and-forget notification; no id, no correlation.
    pub(crate) async fn notify(&self, operation: &str, params: Value) -> Result<()> {
        let method = self.dialect.wire_method(operation)?;
        let params = self.dialect.translate_params(operation, params);
        let notification = JsonRpcNotification::new(method, Some(params));
        self.writer.write_message(&notification).await
    }

    /// Stop the reader and reject everything pending. Used on client stop;
    /// crash paths reach the same cleanup when the reader observes EOF.
    pub(crate) async fn shutdown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.reader_task.abort();
        self.pending.lock().await.clear();
    }
}

#[allow(clippy::too_many_arguments)]
async fn reader_loop(
    mut reader: FramedReader,
    dialect: Dialect,
    writer: Arc<FramedWriter>,
    pending: PendingTable,
    connected: Arc<AtomicBool>,
    sessions: Arc<SessionRegistry>,
    lifecycle: Arc<LifecycleRegistry>,
) {
    while let Some(message) = reader.next_message().await {
        match classify_message(&message) {
            MessageKind::Response => {
                let response: JsonRpcResponse = match serde_json::from_value(message) {
                    Ok(response) => response,
                    Err(e) => {
                        warn!("failed to parse response: {}", e);
                        continue;
                    }
                };
                let Some(id) = response.id else {
                    continue;
                };
                let sender = pending.lock().await.remove(&id);
                match sender {
                    Some(tx) => {
                        trace!("delivering response for request {}", id);
                        let _ = tx.send(response);
                    }
                    None => debug!(
                        "no pending receiver for response id={} (timed out or discarded)",
                        id
                    ),
                }
            }

            MessageKind::IncomingRequest => {
                let id = message.get("id").cloned().unwrap_or(Value::Null);
                let method = message
                    .get("method")
                    .and_then(|m| m.as_str())
                    .unwrap_or_default()
                    .to_string();
                let params = message.get("params").cloned().unwrap_or(Value::Null);

                let writer = Arc::clone(&writer);
                let sessions = Arc::clone(&sessions);
                tokio::spawn(async move {
                    let response = answer_server_request(&method, params, id, &sessions).await;
                    if let Err(e) = writer.write_message(&response).await {
                        error!("failed to send response for {}: {}", method, e);
                    }
                });
            }

            MessageKind::Notification => {
                let method = message
                    .get("method")
                    .and_then(|m| m.as_str())
                    .unwrap_or_default();
                let params = message.get("params").cloned().unwrap_or(Value::Null);

                match translate_notification(dialect, method, params) {
                    InboundEvent::Session { session_id, event } => {
                        match sessions.get(&session_id) {
                            Some(session) => session.dispatch_event(event),
                            None => debug!(
                                "no route for session_id={}, dropping event type={}",
                                session_id,
                                event.event_type()
                            ),
                        }
                    }
                    InboundEvent::Lifecycle(params) => {
                        match serde_json::from_value::<SessionLifecycleEvent>(params) {
                            Ok(event) => lifecycle.dispatch(&event),
                            Err(e) => warn!("failed to parse lifecycle event: {}", e),
                        }
                    }
                    InboundEvent::Unknown { method, .. } => {
                        trace!("ignoring notification method={}", method);
                    }
                }
            }
        }
    }

    // Reader ended: fail everything pending uniformly and close streams.
    debug!("reader loop ended, rejecting pending requests");
    connected.store(false, Ordering::SeqCst);
    pending.lock().await.clear();
    sessions.close_streams();
}

/// Answer a server-initiated request. Tool failures are always converted to
/// result envelopes; only malformed payloads and unknown sessions produce
/// JSON-RPC errors.
async fn answer_server_request(
    method: &str,
    params: Value,
    id: Value,
    sessions: &SessionRegistry,
) -> JsonRpcResponseOut {
    match method {
        "tool.call" => {
            let invocation: ToolInvocation = match serde_json::from_value(params) {
                Ok(invocation) => invocation,
                Err(e) => {
                    return JsonRpcResponseOut::failure(
                        id,
                        -32602,
                        format!("invalid tool call payload: {e}"),
                    );
                }
            };
            let Some(session) = sessions.get(&invocation.session_id) else {
                return JsonRpcResponseOut::failure(
                    id,
                    -32602,
                    format!("unknown session {}", invocation.session_id),
                );
            };

            debug!(
                "tool.call {} tool={} session={}",
                invocation.tool_call_id, invocation.tool_name, invocation.session_id
            );
            let handler = session.tool_handler(&invocation.tool_name);
            let result = run_tool_call(handler, invocation).await;
            match serde_json::to_value(&result) {
                Ok(value) => {
                    JsonRpcResponseOut::success(id, serde_json::json!({"result": value}))
                }
                Err(e) => JsonRpcResponseOut::failure(
                    id,
                    -32603,
                    format!("failed to serialize tool result: {e}"),
                ),
            }
        }

        "permission.request" => {
            let session_id = params
                .get("sessionId")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let Some(session) = sessions.get(&session_id) else {
                return JsonRpcResponseOut::failure(
                    id,
                    -32602,
                    format!("unknown session {session_id}"),
                );
            };

            let request: PermissionRequest = params
                .get("request")
                .cloned()
                .and_then(|r| serde_json::from_value(r).ok())
                .unwrap_or(PermissionRequest {
                    kind: String::new(),
                    tool_call_id: None,
                    extra: serde_json::Map::new(),
                });

            let result = match session.permission_handler() {
                None => PermissionRequestResult::denied(),
                Some(handler) => {
                    let invocation = PermissionInvocation {
                        session_id: session_id.clone(),
                    };
                    match AssertUnwindSafe(handler(request, invocation))
                        .catch_unwind()
                        .await
                    {
                        Ok(result) => result,
                        // Handler failure denies the permission.
                        Err(_) => PermissionRequestResult::denied(),
                    }
                }
            };
            match serde_json::to_value(&result) {
                Ok(value) => {
                    JsonRpcResponseOut::success(id, serde_json::json!({"result": value}))
                }
                Err(e) => JsonRpcResponseOut::failure(id, -32603, e.to_string()),
            }
        }

        "userInput.request" => {
            let session_id = params
                .get("sessionId")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let Some(session) = sessions.get(&session_id) else {
                return JsonRpcResponseOut::failure(
                    id,
                    -32602,
                    format!("unknown session {session_id}"),
                );
            };
            let request: UserInputRequest = match serde_json::from_value(params) {
                Ok(request) => request,
                Err(e) => {
                    return JsonRpcResponseOut::failure(
                        id,
                        -32602,
                        format!("invalid user input request payload: {e}"),
                    );
                }
            };

            match session.user_input_handler() {
                None => JsonRpcResponseOut::failure(
                    id,
                    -32603,
                    "user input requested but no handler registered",
                ),
                Some(handler) => {
                    let invocation = UserInputInvocation {
                        session_id: session_id.clone(),
                    };
                    match handler(request, invocation).await {
                        Ok(response) => match serde_json::to_value(&response) {
                            Ok(value) => JsonRpcResponseOut::success(id, value),
                            Err(e) => {
                                JsonRpcResponseOut::failure(id, -32603, e.to_string())
                            }
                        },
                        Err(e) => JsonRpcResponseOut::failure(id, -32603, e.to_string()),
                    }
                }
            }
        }

        "hooks.invoke" => {
            let session_id = params
                .get("sessionId")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let hook_type = params
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let input = params.get("input").cloned().unwrap_or(Value::Null);

            let Some(session) = sessions.get(&session_id) else {
                return JsonRpcResponseOut::failure(
                    id,
                    -32602,
                    format!("unknown session {session_id}"),
                );
            };

            let handler = session
                .hooks()
                .and_then(|hooks| hooks.handler_for(&hook_type));
            match handler {
                None => JsonRpcResponseOut::success(id, serde_json::json!({})),
                Some(handler) => {
                    let invocation = crate::tools::HookInvocation {
                        session_id: session_id.clone(),
                    };
                    match handler(input, invocation).await {
                        Ok(Some(output)) => JsonRpcResponseOut::success(
                            id,
                            serde_json::json!({"output": output}),
                        ),
                        Ok(None) => JsonRpcResponseOut::success(id, serde_json::json!({})),
                        Err(e) => JsonRpcResponseOut::failure(id, -32603, e.to_string()),
                    }
                }
            }
        }

        other => JsonRpcResponseOut::failure(id, -32601, format!("Method not found: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionShared;
    use crate::tools::{HandlerError, Tool};
    use crate::transport::Transport;
    use tokio::io::{AsyncRead, AsyncWrite};

    struct Peer {
        transport: Transport,
    }

    fn connected_pair() -> (Arc<MessageRouter>, Peer, Arc<SessionRegistry>) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let (near_read, near_write) = tokio::io::split(near);
        let (far_read, far_write) = tokio::io::split(far);

        let sessions = Arc::new(SessionRegistry::default());
        let lifecycle = Arc::new(LifecycleRegistry::default());
        let router = MessageRouter::start(
            transport_from(near_read, near_write),
            Dialect::Native,
            Arc::clone(&sessions),
            lifecycle,
        );
        let peer = Peer {
            transport: transport_from(far_read, far_write),
        };
        (router, peer, sessions)
    }

    fn transport_from(
        read: impl AsyncRead + Send + Unpin + 'static,
        write: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Transport {
        Transport::new(read, write)
    }

    #[tokio::test]
    async fn call_resolves_with_matching_response() {
        let (router, mut peer, _sessions) = connected_pair();

        let server = tokio::spawn(async move {
            let request = peer.transport.reader.next_message().await.unwrap();
            assert_eq!(request["method"], "ping");
            let id = request["id"].as_u64().unwrap();
            peer.transport
                .writer
                .write_message(&serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"message": "pong"},
                }))
                .await
                .unwrap();
        });

        let result = router
            .call("ping", serde_json::json!({}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result["message"], "pong");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn call_rejects_with_structured_rpc_error() {
        let (router, mut peer, _sessions) = connected_pair();

        tokio::spawn(async move {
            let request = peer.transport.reader.next_message().await.unwrap();
            let id = request["id"].as_u64().unwrap();
            peer.transport
                .writer
                .write_message(&serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32000, "message": "kaboom"},
                }))
                .await
                .unwrap();
        });

        let err = router
            .call("ping", serde_json::json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            Error::Rpc { code, message, .. } => {
                assert_eq!(code, -32000);
                assert_eq!(message, "kaboom");
            }
            other => panic!("expected rpc error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_discards_pending_and_ignores_late_response() {
        let (router, mut peer, _sessions) = connected_pair();

        let err = router
            .call("ping", serde_json::json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        // Deliver the response late; the router must ignore it quietly.
        let request = peer.transport.reader.next_message().await.unwrap();
        let id = request["id"].as_u64().unwrap();
        peer.transport
            .writer
            .write_message(&serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {},
            }))
            .await
            .unwrap();

        // A subsequent call still works: no duplicate resolution, no crash.
        let server = tokio::spawn(async move {
            let request = peer.transport.reader.next_message().await.unwrap();
            let id = request["id"].as_u64().unwrap();
            peer.transport
                .writer
                .write_message(&serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"message": "pong"},
                }))
                .await
                .unwrap();
        });
        let result = router
            .call("ping", serde_json::json!({}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result["message"], "pong");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unsupported_acp_operation_produces_no_wire_traffic() {
        let (near, far) = tokio::io::duplex(4096);
        let (near_read, near_write) = tokio::io::split(near);
        let (mut far_read, _far_write) = tokio::io::split(far);

        let router = MessageRouter::start(
            transport_from(near_read, near_write),
            Dialect::Acp,
            Arc::new(SessionRegistry::default()),
            Arc::new(LifecycleRegistry::default()),
        );

        let err = router
            .call("session.list", serde_json::json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation { .. }));

        // Nothing was written: reading from the peer would block, so poll it
        // with a zero-ish timeout instead.
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(
            Duration::from_millis(50),
            tokio::io::AsyncReadExt::read(&mut far_read, &mut buf),
        )
        .await;
        assert!(read.is_err(), "expected no wire traffic");
    }

    #[tokio::test]
    async fn notifications_route_to_registered_session() {
        let (_router, peer, sessions) = connected_pair();
        let shared = SessionShared::new("s1".to_string(), None, Dialect::Native);
        sessions.insert(Arc::clone(&shared));
        let mut rx = shared.subscribe();

        peer.transport
            .writer
            .write_message(&serde_json::json!({
                "jsonrpc": "2.0",
                "method": "session.event",
                "params": {
                    "sessionId": "s1",
                    "event": {"type": "assistant.message", "data": {"content": "hey"}},
                },
            }))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.content_text().as_deref(), Some("hey"));
    }

    #[tokio::test]
    async fn tool_call_request_is_answered_with_result_envelope() {
        let (_router, mut peer, sessions) = connected_pair();
        let shared = SessionShared::new("s1".to_string(), None, Dialect::Native);
        shared.register_tools(&[Tool::new(
            "get_weather",
            "Get weather",
            serde_json::json!({}),
            |_| async { Ok::<_, HandlerError>("sunny") },
        )]);
        sessions.insert(shared);

        peer.transport
            .writer
            .write_message(&serde_json::json!({
                "jsonrpc": "2.0",
                "id": 99,
                "method": "tool.call",
                "params": {
                    "sessionId": "s1",
                    "toolCallId": "tc1",
                    "toolName": "get_weather",
                    "arguments": {"location": "Kyoto"},
                },
            }))
            .await
            .unwrap();

        let response = peer.transport.reader.next_message().await.unwrap();
        assert_eq!(response["id"], 99);
        assert_eq!(response["result"]["result"]["resultType"], "success");
        assert_eq!(response["result"]["result"]["textResultForLlm"], "sunny");
    }

    #[tokio::test]
    async fn unregistered_tool_yields_failure_envelope_not_silence() {
        let (_router, mut peer, sessions) = connected_pair();
        sessions.insert(SessionShared::new(
            "s1".to_string(),
            None,
            Dialect::Native,
        ));

        peer.transport
            .writer
            .write_message(&serde_json::json!({
                "jsonrpc": "2.0",
                "id": 7,
                "method": "tool.call",
                "params": {
                    "sessionId": "s1",
                    "toolCallId": "tc2",
                    "toolName": "missing_tool",
                    "arguments": {},
                },
            }))
            .await
            .unwrap();

        let response = peer.transport.reader.next_message().await.unwrap();
        assert_eq!(response["id"], 7);
        let result = &response["result"]["result"];
        assert_eq!(result["resultType"], "failure");
        assert_eq!(result["error"], "tool 'missing_tool' not supported");
    }

    #[tokio::test]
    async fn permission_request_without_handler_is_denied() {
        let (_router, mut peer, sessions) = connected_pair();
        sessions.insert(SessionShared::new(
            "s1".to_string(),
            None,
            Dialect::Native,
        ));

        peer.transport
            .writer
            .write_message(&serde_json::json!({
                "jsonrpc": "2.0",
                "id": 11,
                "method": "permission.request",
                "params": {
                    "sessionId": "s1",
                    "request": {"kind": "write", "toolCallId": "tc1"},
                },
            }))
            .await
            .unwrap();

        let response = peer.transport.reader.next_message().await.unwrap();
        assert_eq!(
            response["result"]["result"]["kind"],
            "denied-no-approval-rule-and-could-not-request-from-user"
        );
    }

    #[tokio::test]
    async fn connection_loss_rejects_pending_calls() {
        let (router, peer, _sessions) = connected_pair();

        let call = tokio::spawn({
            let router = Arc::clone(&router);
            async move {
                router
                    .call("ping", serde_json::json!({}), Duration::from_secs(5))
                    .await
            }
        });

        // Give the call a moment to register, then sever the connection.
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(peer);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ConnectionLost(_)), "got {err:?}");
        assert!(!router.is_connected());
    }
}
