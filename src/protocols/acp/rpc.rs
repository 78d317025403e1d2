//! JSON-RPC 2.0 plumbing on top of the framed duplex.
//!
//! `RpcChannel` owns the write half (single writer) and the table of
//! outbound requests awaiting a response. The read loop in `agent.rs`
//! classifies inbound frames with [`IncomingMessage::classify`] and hands
//! responses back through [`RpcChannel::complete`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::oneshot;

use super::transport::FrameWriter;
use crate::api::types::ApiError;

/// Method not found
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Invalid method parameters
pub const INVALID_PARAMS: i64 = -32602;
/// Internal error on this side
pub const INTERNAL_ERROR: i64 = -32603;
/// Generic application error
pub const SERVER_ERROR: i64 = -32000;

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("JSON-RPC error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }
}

impl From<ApiError> for RpcError {
    fn from(error: ApiError) -> Self {
        let code = match error {
            ApiError::InvalidInput { .. } => INVALID_PARAMS,
            ApiError::ProtocolError { .. } => INTERNAL_ERROR,
            _ => SERVER_ERROR,
        };
        Self::new(code, error.to_string())
    }
}

/// An inbound JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    /// Agent-initiated call that needs a response
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    /// Agent-initiated call without response
    Notification { method: String, params: Value },
    /// Response to one of our requests
    Response {
        id: Value,
        outcome: Result<Value, RpcError>,
    },
}

impl IncomingMessage {
    /// Classify a decoded frame. Returns `None` for values that are not
    /// JSON-RPC messages at all.
    pub fn classify(message: Value) -> Option<Self> {
        let Value::Object(mut fields) = message else {
            return None;
        };

        let id = fields.remove("id").filter(|id| !id.is_null());
        let method = fields
            .remove("method")
            .and_then(|m| m.as_str().map(str::to_string));
        let params = fields.remove("params").unwrap_or(Value::Null);

        match (method, id) {
            (Some(method), Some(id)) => Some(IncomingMessage::Request { id, method, params }),
            (Some(method), None) => Some(IncomingMessage::Notification { method, params }),
            (None, Some(id)) => {
                let outcome = match fields.remove("error") {
                    Some(error) => Err(serde_json::from_value(error.clone()).unwrap_or_else(
                        |_| RpcError::new(SERVER_ERROR, format!("Malformed error object: {error}")),
                    )),
                    None => Ok(fields.remove("result").unwrap_or(Value::Null)),
                };
                Some(IncomingMessage::Response { id, outcome })
            }
            (None, None) => None,
        }
    }
}

type PendingResponse = oneshot::Sender<Result<Value, RpcError>>;

/// Exclusive writer plus outbound request correlation.
pub struct RpcChannel {
    writer: tokio::sync::Mutex<Option<FrameWriter>>,
    pending: Mutex<HashMap<u64, PendingResponse>>,
    next_id: AtomicU64,
}

impl RpcChannel {
    pub fn new(writer: FrameWriter) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(Some(writer)),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Send a request and wait for the matching response.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, ApiError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, tx);

        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        if let Err(e) = self.write(&message).await {
            self.pending().remove(&id);
            return Err(e);
        }
        log::debug!("Sent JSON-RPC request: id={id}, method={method}");

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(error)) => Err(ApiError::Rpc {
                code: error.code,
                message: error.message,
            }),
            Err(_) => Err(ApiError::ConnectionClosed),
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), ApiError> {
        let message = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.write(&message).await
    }

    /// Answer an agent-initiated request.
    pub async fn respond(
        &self,
        id: Value,
        outcome: Result<Value, RpcError>,
    ) -> Result<(), ApiError> {
        let message = match outcome {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err(error) => json!({"jsonrpc": "2.0", "id": id, "error": error}),
        };
        self.write(&message).await
    }

    /// Route a response to whoever is waiting for it.
    pub fn complete(&self, id: &Value, outcome: Result<Value, RpcError>) {
        let key = match id {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        };

        let sender = key.and_then(|key| self.pending().remove(&key));
        match sender {
            Some(sender) => {
                let _ = sender.send(outcome);
            }
            None => log::debug!("Response for unknown request: id={id}"),
        }
    }

    /// Fail every outstanding request with `ConnectionClosed`.
    pub fn fail_pending(&self) -> usize {
        let drained: Vec<_> = self.pending().drain().collect();
        // Dropping the senders wakes the waiters with a receive error
        drained.len()
    }

    /// Close the write side (graceful close) and fail outstanding requests.
    pub async fn close(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.close().await {
                log::debug!("Closing agent stdin failed: {e}");
            }
        }
        let failed = self.fail_pending();
        if failed > 0 {
            log::debug!("Failed pending requests on close: count={failed}");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    async fn write(&self, message: &Value) -> Result<(), ApiError> {
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(writer) => writer.send(message).await,
            None => Err(ApiError::ConnectionClosed),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, PendingResponse>> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::acp::transport::{Frame, FrameReader};
    use std::sync::Arc;

    #[test]
    fn test_classify_messages() {
        let request = IncomingMessage::classify(json!({
            "jsonrpc": "2.0", "id": 7, "method": "fs/read_text_file", "params": {"path": "a"}
        }));
        assert!(matches!(
            request,
            Some(IncomingMessage::Request { ref method, .. }) if method == "fs/read_text_file"
        ));

        let notification = IncomingMessage::classify(json!({
            "jsonrpc": "2.0", "method": "session/update", "params": {}
        }));
        assert!(matches!(notification, Some(IncomingMessage::Notification { .. })));

        let error = IncomingMessage::classify(json!({
            "jsonrpc": "2.0", "id": 1, "error": {"code": -32601, "message": "nope"}
        }));
        match error {
            Some(IncomingMessage::Response { outcome: Err(e), .. }) => assert_eq!(e.code, -32601),
            other => panic!("Expected error response, got {other:?}"),
        }

        assert_eq!(IncomingMessage::classify(json!([1, 2])), None);
        assert_eq!(IncomingMessage::classify(json!({"jsonrpc": "2.0"})), None);
    }

    #[tokio::test]
    async fn test_request_correlates_response() {
        let (client, agent) = tokio::io::duplex(4096);
        let (_client_read, client_write) = tokio::io::split(client);
        let (agent_read, _agent_write) = tokio::io::split(agent);

        let channel = Arc::new(RpcChannel::new(FrameWriter::new(client_write)));
        let mut agent_reader = FrameReader::new(agent_read);

        let call = tokio::spawn({
            let channel = channel.clone();
            async move { channel.request("session/new", json!({"cwd": "/tmp"})).await }
        });

        let Some(Frame::Message(sent)) = agent_reader.next_frame().await.unwrap() else {
            panic!("expected a request frame");
        };
        assert_eq!(sent["method"], "session/new");
        channel.complete(&sent["id"], Ok(json!({"sessionId": "s-1"})));

        let result = call.await.unwrap().unwrap();
        assert_eq!(result["sessionId"], "s-1");
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_pending_requests() {
        let (client, agent) = tokio::io::duplex(4096);
        let (_client_read, client_write) = tokio::io::split(client);
        let (agent_read, _agent_write) = tokio::io::split(agent);

        let channel = Arc::new(RpcChannel::new(FrameWriter::new(client_write)));
        let mut agent_reader = FrameReader::new(agent_read);

        let call = tokio::spawn({
            let channel = channel.clone();
            async move { channel.request("session/prompt", json!({})).await }
        });
        agent_reader.next_frame().await.unwrap();

        channel.close().await;

        assert_eq!(call.await.unwrap(), Err(ApiError::ConnectionClosed));
        assert_eq!(
            channel.notify("session/cancel", json!({})).await,
            Err(ApiError::ConnectionClosed)
        );
    }
}
