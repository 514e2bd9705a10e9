//! Request/response protocol for cross-context calls
//!
//! Every request gets a unique id and a deadline. Whatever shape the other
//! side answers with is normalized into [`Response`], and transport failures
//! become typed failure codes instead of errors.
//!
//! # Example
//!
//! ```ignore
//! use quicktab_sync_core::protocol::{MessageClient, RequestOptions};
//!
//! let client = MessageClient::new(transport, RequestConfig::default());
//! let response = client
//!     .send_request_with_timeout("BATCH_UPDATE", payload, RequestOptions::timeout_ms(250))
//!     .await;
//! if response.is_success() { /* ... */ }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::RequestConfig;
use crate::error::TransportError;
use crate::model::now_ms;

/// Correlates a request with its response or acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generates request ids from a monotonic counter plus a timestamp.
///
/// The counter alone makes ids unique within a process; the timestamp keeps
/// ids from different processes apart in logs.
#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    counter: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> RequestId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        RequestId(format!("req-{}-{}", n, now_ms()))
    }
}

/// An outbound cross-context message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub request_id: RequestId,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
}

/// The best-effort delivery primitive between contexts.
///
/// `send` may fail because nothing is listening, or may resolve after an
/// arbitrary delay. The protocol layer compensates for both.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request) -> Result<Value, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: Request) -> Result<Value, TransportError> {
        (**self).send(request).await
    }
}

/// Failure classification of a [`Response`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The deadline passed before an answer arrived
    Timeout,
    /// No endpoint was listening; safe to retry or queue
    Disconnected,
    /// The other side answered with an explicit failure
    RemoteError,
    /// Any other transport failure
    TransportError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Disconnected => "DISCONNECTED",
            ErrorCode::RemoteError => "REMOTE_ERROR",
            ErrorCode::TransportError => "TRANSPORT_ERROR",
        }
    }

    fn parse(code: &str) -> Option<ErrorCode> {
        match code {
            "TIMEOUT" => Some(ErrorCode::Timeout),
            "DISCONNECTED" => Some(ErrorCode::Disconnected),
            "REMOTE_ERROR" => Some(ErrorCode::RemoteError),
            "TRANSPORT_ERROR" => Some(ErrorCode::TransportError),
            _ => None,
        }
    }
}

/// The single success/error contract for cross-context calls
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Success {
        data: Option<Value>,
        request_id: Option<RequestId>,
    },
    Failure {
        code: ErrorCode,
        message: String,
        request_id: Option<RequestId>,
    },
}

impl Response {
    pub fn success(data: Option<Value>) -> Self {
        Response::Success {
            data,
            request_id: None,
        }
    }

    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Failure {
            code,
            message: message.into(),
            request_id: None,
        }
    }

    pub fn with_request_id(self, id: RequestId) -> Self {
        match self {
            Response::Success { data, .. } => Response::Success {
                data,
                request_id: Some(id),
            },
            Response::Failure { code, message, .. } => Response::Failure {
                code,
                message,
                request_id: Some(id),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Response::Success { .. })
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Response::Success { .. } => None,
            Response::Failure { code, .. } => Some(*code),
        }
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            Response::Success { data, .. } => data.as_ref(),
            Response::Failure { .. } => None,
        }
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Response::Success { request_id, .. } | Response::Failure { request_id, .. } => {
                request_id.as_ref()
            }
        }
    }

    pub fn into_envelope(self) -> ResponseEnvelope {
        self.into()
    }
}

/// Wire shape of a response: `{ success, data?, error?, requestId?, code? }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
}

impl From<Response> for ResponseEnvelope {
    fn from(response: Response) -> Self {
        match response {
            Response::Success { data, request_id } => Self {
                success: true,
                data,
                error: None,
                request_id,
                code: None,
            },
            Response::Failure {
                code,
                message,
                request_id,
            } => Self {
                success: false,
                data: None,
                error: Some(message),
                request_id,
                code: Some(code),
            },
        }
    }
}

/// Map an arbitrary raw answer into a [`Response`].
///
/// - `true` / `false` become success / remote failure
/// - `{ success, data, error, code }` envelopes are honored
/// - legacy `{ error: ... }` objects become remote failures
/// - `null` is an empty success
/// - anything else is success carrying the value as data
pub fn normalize_response(raw: Value) -> Response {
    match raw {
        Value::Null => Response::success(None),
        Value::Bool(true) => Response::success(None),
        Value::Bool(false) => Response::failure(ErrorCode::RemoteError, "request rejected"),
        Value::Object(mut object) => {
            if let Some(Value::Bool(success)) = object.get("success").cloned() {
                if success {
                    return Response::success(object.remove("data").filter(|d| !d.is_null()));
                }
                let code = object
                    .get("code")
                    .and_then(Value::as_str)
                    .and_then(ErrorCode::parse)
                    .unwrap_or(ErrorCode::RemoteError);
                let message = object
                    .get("error")
                    .map(error_text)
                    .unwrap_or_else(|| "request failed".to_string());
                return Response::failure(code, message);
            }
            match object.get("error") {
                Some(error) if !error.is_null() => {
                    Response::failure(ErrorCode::RemoteError, error_text(error))
                }
                _ => Response::success(Some(Value::Object(object))),
            }
        }
        other => Response::success(Some(other)),
    }
}

fn error_text(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(o) => o
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

/// Per-call overrides of [`RequestConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    /// Wait for a separate acknowledgement when the direct answer is empty
    pub require_ack: Option<bool>,
}

impl RequestOptions {
    pub fn timeout_ms(ms: u64) -> Self {
        Self {
            timeout: Some(Duration::from_millis(ms)),
            require_ack: None,
        }
    }

    pub fn with_ack(mut self) -> Self {
        self.require_ack = Some(true);
        self
    }
}

/// Counters exposed by [`MessageClient::stats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProtocolStats {
    pub sent: u64,
    pub succeeded: u64,
    pub timeouts: u64,
    pub disconnects: u64,
    pub stale_acks: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    succeeded: AtomicU64,
    timeouts: AtomicU64,
    disconnects: AtomicU64,
    stale_acks: AtomicU64,
}

/// Sends requests over a [`Transport`] with deadlines and acknowledgements
pub struct MessageClient<T: Transport> {
    transport: T,
    config: RequestConfig,
    ids: RequestIdGenerator,
    awaiting_ack: Mutex<HashMap<RequestId, oneshot::Sender<Value>>>,
    counters: Counters,
}

impl<T: Transport> std::fmt::Debug for MessageClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageClient")
            .field("config", &self.config)
            .field("awaiting_ack", &self.awaiting().len())
            .finish()
    }
}

impl<T: Transport> MessageClient<T> {
    pub fn new(transport: T, config: RequestConfig) -> Self {
        Self {
            transport,
            config,
            ids: RequestIdGenerator::new(),
            awaiting_ack: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &RequestConfig {
        &self.config
    }

    /// Send with the configured defaults
    pub async fn request(&self, action: &str, payload: Value) -> Response {
        self.send_request_with_timeout(action, payload, RequestOptions::default())
            .await
    }

    /// Send a request and race it against its deadline.
    ///
    /// On expiry the caller gets a `TIMEOUT` failure immediately. The
    /// in-flight send is dropped, and an acknowledgement that arrives later
    /// is discarded by [`acknowledge`](Self::acknowledge).
    pub async fn send_request_with_timeout(
        &self,
        action: &str,
        payload: Value,
        options: RequestOptions,
    ) -> Response {
        let timeout = options.timeout.unwrap_or(self.config.timeout);
        let require_ack = options.require_ack.unwrap_or(self.config.require_ack);
        let request_id = self.ids.next_id();
        let request = Request {
            request_id: request_id.clone(),
            action: action.to_string(),
            payload,
        };

        let ack_rx = if require_ack {
            let (tx, rx) = oneshot::channel();
            self.awaiting().insert(request_id.clone(), tx);
            Some(rx)
        } else {
            None
        };

        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        debug!(request_id = %request_id, action, ?timeout, require_ack, "Sending request");

        let exchange = async {
            let raw = match self.transport.send(request).await {
                Ok(raw) => raw,
                Err(err) => return self.classify_transport_error(err),
            };
            match (raw, ack_rx) {
                (Value::Null, Some(rx)) => match rx.await {
                    Ok(ack) => normalize_response(ack),
                    Err(_) => Response::failure(ErrorCode::TransportError, "acknowledgement channel closed"),
                },
                (raw, _) => normalize_response(raw),
            }
        };

        let response = match tokio::time::timeout(timeout, exchange).await {
            Ok(response) => response,
            Err(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(request_id = %request_id, action, ?timeout, "Request timed out");
                Response::failure(ErrorCode::Timeout, "timeout")
            }
        };

        self.awaiting().remove(&request_id);
        if response.is_success() {
            self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
        }
        response.with_request_id(request_id)
    }

    /// Retry while the peer is disconnected, up to the configured attempts.
    ///
    /// Any other outcome, success or failure, is returned immediately.
    pub async fn send_with_retry(&self, action: &str, payload: Value) -> Response {
        let attempts = self.config.retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            let response = self
                .send_request_with_timeout(action, payload.clone(), RequestOptions::default())
                .await;
            if response.code() != Some(ErrorCode::Disconnected) || attempt >= attempts {
                return response;
            }
            debug!(action, attempt, "Peer disconnected, retrying");
            attempt += 1;
            tokio::time::sleep(self.config.retry_backoff).await;
        }
    }

    /// Deliver an out-of-band acknowledgement.
    ///
    /// Returns `false` when no request with this id is waiting, which is the
    /// case once it has completed or timed out. Such late acknowledgements
    /// are dropped without effect.
    pub fn acknowledge(&self, request_id: &RequestId, ack: Value) -> bool {
        let sender = self.awaiting().remove(request_id);
        match sender {
            Some(tx) => tx.send(ack).is_ok(),
            None => {
                self.counters.stale_acks.fetch_add(1, Ordering::Relaxed);
                debug!(request_id = %request_id, "Ignoring stale acknowledgement");
                false
            }
        }
    }

    /// Number of requests still waiting for an acknowledgement
    pub fn pending_acks(&self) -> usize {
        self.awaiting().len()
    }

    pub fn stats(&self) -> ProtocolStats {
        ProtocolStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            disconnects: self.counters.disconnects.load(Ordering::Relaxed),
            stale_acks: self.counters.stale_acks.load(Ordering::Relaxed),
        }
    }

    fn classify_transport_error(&self, err: TransportError) -> Response {
        if err.is_disconnected() {
            self.counters.disconnects.fetch_add(1, Ordering::Relaxed);
            debug!(error = %err, "No receiving endpoint");
            Response::failure(ErrorCode::Disconnected, err.to_string())
        } else {
            warn!(error = %err, "Transport failure");
            Response::failure(ErrorCode::TransportError, err.to_string())
        }
    }

    fn awaiting(&self) -> MutexGuard<'_, HashMap<RequestId, oneshot::Sender<Value>>> {
        self.awaiting_ack
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn test_request_ids_are_unique() {
        let ids = RequestIdGenerator::new();
        let set: HashSet<_> = (0..1000).map(|_| ids.next_id()).collect();
        assert_eq!(set.len(), 1000);
    }

    #[test]
    fn test_normalize_shapes() {
        assert_eq!(normalize_response(json!(true)), Response::success(None));
        assert_eq!(normalize_response(Value::Null), Response::success(None));
        assert_eq!(normalize_response(json!(false)).code(), Some(ErrorCode::RemoteError));

        let legacy = normalize_response(json!({ "error": "quota" }));
        assert_eq!(legacy, Response::failure(ErrorCode::RemoteError, "quota"));

        let envelope = normalize_response(json!({ "success": true, "data": { "n": 1 } }));
        assert_eq!(envelope.data(), Some(&json!({ "n": 1 })));

        let coded = normalize_response(json!({ "success": false, "code": "TIMEOUT", "error": "slow" }));
        assert_eq!(coded, Response::failure(ErrorCode::Timeout, "slow"));

        let plain = normalize_response(json!({ "tabs": [] }));
        assert_eq!(plain.data(), Some(&json!({ "tabs": [] })));

        let number = normalize_response(json!(7));
        assert_eq!(number.data(), Some(&json!(7)));
    }

    #[test]
    fn test_envelope_wire_shape() {
        let response = Response::failure(ErrorCode::Timeout, "timeout")
            .with_request_id(RequestId::new("req-1"));
        let value = serde_json::to_value(response.into_envelope()).unwrap();
        assert_eq!(
            value,
            json!({ "success": false, "error": "timeout", "requestId": "req-1", "code": "TIMEOUT" })
        );

        let value = serde_json::to_value(Response::success(None).into_envelope()).unwrap();
        assert_eq!(value, json!({ "success": true }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_isolation() {
        let transport = Arc::new(MockTransport::new().with_delay(Duration::from_millis(1000)));
        let client = MessageClient::new(Arc::clone(&transport), RequestConfig::default());

        let started = tokio::time::Instant::now();
        let response = client
            .send_request_with_timeout("PING", json!({}), RequestOptions::timeout_ms(10))
            .await;

        assert_eq!(response.code(), Some(ErrorCode::Timeout));
        assert!(started.elapsed() < Duration::from_millis(50));
        assert!(response.request_id().is_some());

        // Let the original delay elapse; the dropped send never completes.
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(transport.completed(), 0);
        assert_eq!(client.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_disconnected_is_typed_failure() {
        let transport = MockTransport::new().failing(TransportError::NoReceiver);
        let client = MessageClient::new(transport, RequestConfig::default());

        let response = client.request("PING", json!({})).await;
        assert_eq!(response.code(), Some(ErrorCode::Disconnected));
        assert_eq!(client.stats().disconnects, 1);
    }

    #[tokio::test]
    async fn test_other_transport_failure() {
        let transport = MockTransport::new().failing(TransportError::Failed("boom".into()));
        let client = MessageClient::new(transport, RequestConfig::default());
        let response = client.request("PING", json!({})).await;
        assert_eq!(response.code(), Some(ErrorCode::TransportError));
    }

    #[tokio::test]
    async fn test_success_carries_request_id() {
        let transport = MockTransport::new().responding(json!({ "success": true, "data": 5 }));
        let client = MessageClient::new(transport, RequestConfig::default());

        let response = client.request("PING", json!({})).await;
        assert!(response.is_success());
        assert_eq!(response.data(), Some(&json!(5)));
        assert!(response.request_id().unwrap().as_str().starts_with("req-"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_on_disconnect_only() {
        let transport = Arc::new(MockTransport::new().failing(TransportError::NoReceiver));
        let config = RequestConfig {
            retry_attempts: 3,
            ..RequestConfig::default()
        };
        let client = MessageClient::new(Arc::clone(&transport), config);

        let response = client.send_with_retry("PING", json!({})).await;
        assert_eq!(response.code(), Some(ErrorCode::Disconnected));
        assert_eq!(transport.sent().len(), 3);

        let transport = Arc::new(MockTransport::new().responding(json!(false)));
        let client = MessageClient::new(Arc::clone(&transport), RequestConfig::default());
        let response = client.send_with_retry("PING", json!({})).await;
        assert_eq!(response.code(), Some(ErrorCode::RemoteError));
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_band_ack() {
        let transport = Arc::new(MockTransport::new());
        let client = Arc::new(MessageClient::new(
            Arc::clone(&transport),
            RequestConfig::default(),
        ));

        let c = Arc::clone(&client);
        let pending = tokio::spawn(async move {
            c.send_request_with_timeout("SAVE", json!({}), RequestOptions::timeout_ms(500).with_ack())
                .await
        });

        // Wait until the request is registered, then acknowledge it.
        while client.pending_acks() == 0 {
            tokio::task::yield_now().await;
        }
        let id = transport.sent()[0].request_id.clone();
        assert!(client.acknowledge(&id, json!({ "success": true, "data": "saved" })));

        let response = pending.await.unwrap();
        assert_eq!(response.data(), Some(&json!("saved")));
        assert_eq!(client.pending_acks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_ack_is_discarded() {
        let transport = Arc::new(MockTransport::new());
        let client = MessageClient::new(Arc::clone(&transport), RequestConfig::default());

        let response = client
            .send_request_with_timeout("SAVE", json!({}), RequestOptions::timeout_ms(10).with_ack())
            .await;
        assert_eq!(response.code(), Some(ErrorCode::Timeout));

        let id = transport.sent()[0].request_id.clone();
        assert!(!client.acknowledge(&id, json!(true)));
        assert_eq!(client.stats().stale_acks, 1);
        assert_eq!(client.pending_acks(), 0);
    }
}
