//! Core request/response data model.
//!
//! A [`Request`] describes one logical inbound or internal call. It is built
//! up by the dispatcher (single writer), frozen into an `Arc` before request
//! tracking begins, and detached from the task-local "current request" stack
//! once finalization completes. Calls within calls push and pop that stack.
use std::{
    any::Any,
    fmt,
    sync::{Arc, Mutex},
    time::{Duration, Instant, SystemTime},
};

use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{core::caller::Caller, error::ApiError};

/// 16-byte trace identifier, hex on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId(pub [u8; 16]);

/// 8-byte span identifier, hex on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId(pub [u8; 8]);

fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn decode_hex(s: &str, out: &mut [u8]) -> bool {
    if s.len() != out.len() * 2 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return false;
    }
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16).unwrap_or(0) as u8;
        let lo = (chunk[1] as char).to_digit(16).unwrap_or(0) as u8;
        out[i] = (hi << 4) | lo;
    }
    true
}

impl TraceId {
    /// Generate a fresh random trace id (new trace root).
    pub fn generate() -> Self {
        Self(rand::random())
    }

    pub fn parse_hex(s: &str) -> Option<Self> {
        let mut buf = [0u8; 16];
        decode_hex(s, &mut buf).then_some(Self(buf))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 16]
    }
}

impl SpanId {
    pub fn generate() -> Self {
        Self(rand::random())
    }

    pub fn parse_hex(s: &str) -> Option<Self> {
        let mut buf = [0u8; 8];
        decode_hex(s, &mut buf).then_some(Self(buf))
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_hex(&self.0))
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_hex(&self.0))
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({self})")
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpanId({self})")
    }
}

/// What kind of logical call a [`Request`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    /// A typed or raw API call.
    ApiCall,
    /// An invocation of the registered auth handler.
    AuthHandler,
    /// A pub/sub message delivery.
    PubSubMessage,
}

/// Ordered list of extracted path parameters (name, value).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathParams(pub Vec<(String, String)>);

impl PathParams {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One logical inbound or internal call, frozen before tracking begins.
pub struct Request {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub typ: RequestType,
    pub service: String,
    pub endpoint: String,
    pub started_at: SystemTime,
    pub start: Instant,
    /// Sampling decision: whether trace events are recorded for this request.
    pub traced: bool,
    /// Request-scoped logger span. Handlers log through this.
    pub span: tracing::Span,
    /// Raw request payload retained for trace attachment (typed endpoints).
    pub payload: Option<serde_json::Value>,
    pub path_params: PathParams,
    pub caller: Option<Caller>,
    pub auth_uid: Option<String>,
    /// Opaque auth user-data, type-checked against the registered schema.
    pub auth_data: Option<Arc<dyn Any + Send + Sync>>,
}

impl Request {
    pub fn duration(&self) -> Duration {
        self.start.elapsed()
    }

    /// Whether this request came in over a verified service-to-service path.
    pub fn is_internal(&self) -> bool {
        self.caller.is_some()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("trace_id", &self.trace_id)
            .field("span_id", &self.span_id)
            .field("typ", &self.typ)
            .field("service", &self.service)
            .field("endpoint", &self.endpoint)
            .field("auth_uid", &self.auth_uid)
            .finish_non_exhaustive()
    }
}

/// Raw bytes captured from a request or response body for trace attachment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedBody {
    pub data: Bytes,
    /// Set once the capture cap was exceeded; `data` holds exactly the cap.
    pub overflowed: bool,
}

/// Outcome of a [`Request`]. Constructed once at finalization, immutable
/// afterwards.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub error: Option<ApiError>,
    /// Serialized response payload bytes for typed endpoints.
    pub payload: Option<Bytes>,
    pub captured_request: Option<CapturedBody>,
    pub captured_response: Option<CapturedBody>,
    pub extra_headers: Option<HeaderMap>,
    pub duration: Duration,
}

/// The wire-transmissible subset of a request's identity, propagated across
/// service boundaries.
#[derive(Debug, Clone)]
pub struct CallMeta {
    pub trace_id: TraceId,
    pub parent_span_id: Option<SpanId>,
    /// Originating trace event id from the tracestate sidecar, if any.
    pub parent_event_id: Option<u64>,
    pub traced: bool,
    /// Present only for verified service-to-service calls. Its presence makes
    /// the request eligible for private routes.
    pub internal: Option<InternalCallMeta>,
}

/// The internal sub-record of [`CallMeta`].
#[derive(Debug, Clone)]
pub struct InternalCallMeta {
    pub caller: Caller,
    pub auth_uid: Option<String>,
    pub auth_data: Option<serde_json::Value>,
}

impl CallMeta {
    /// Build metadata for a boundary request with no inbound trace context.
    pub fn new_root() -> Self {
        Self {
            trace_id: TraceId::generate(),
            parent_span_id: None,
            parent_event_id: None,
            traced: true,
            internal: None,
        }
    }

    /// Whether the metadata marks a private-route-capable internal call.
    pub fn private_routes(&self) -> bool {
        self.internal
            .as_ref()
            .map(|i| i.caller.private_routes())
            .unwrap_or(false)
    }
}

/// Serializable auth verdict exchanged with a remotely-hosted auth handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthVerdict {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<serde_json::Value>,
}

// Task-local stack of in-flight requests. The dispatcher seeds one stack per
// top-level request and shares the same stack with spawned inner-call tasks,
// so nesting pushes/pops are observed across task boundaries.
tokio::task_local! {
    static REQUEST_STACK: RequestStack;
}

/// Shared stack of currently-executing requests for one logical execution
/// context. Cheap to clone.
#[derive(Clone, Default)]
pub struct RequestStack {
    inner: Arc<Mutex<Vec<Arc<Request>>>>,
}

impl RequestStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stack of the current task, if executing inside a request scope.
    pub fn current() -> Option<Self> {
        REQUEST_STACK.try_with(|s| s.clone()).ok()
    }

    /// Run `fut` with this stack installed as the task-local request scope.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        REQUEST_STACK.scope(self, fut).await
    }

    pub fn push(&self, req: Arc<Request>) {
        if let Ok(mut stack) = self.inner.lock() {
            stack.push(req);
        }
    }

    pub fn pop(&self) -> Option<Arc<Request>> {
        self.inner.lock().ok().and_then(|mut s| s.pop())
    }

    pub fn top(&self) -> Option<Arc<Request>> {
        self.inner.lock().ok().and_then(|s| s.last().cloned())
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().map(|s| s.len()).unwrap_or(0)
    }
}

/// The request currently executing in this task's scope, if any.
pub fn current_request() -> Option<Arc<Request>> {
    RequestStack::current().and_then(|s| s.top())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_id_hex_round_trip() {
        let id = TraceId::generate();
        let parsed = TraceId::parse_hex(&id.to_string()).unwrap();
        assert_eq!(parsed, id);

        let span = SpanId::generate();
        let parsed = SpanId::parse_hex(&span.to_string()).unwrap();
        assert_eq!(parsed, span);
    }

    #[test]
    fn test_trace_id_rejects_bad_hex() {
        assert!(TraceId::parse_hex("nothex").is_none());
        assert!(TraceId::parse_hex(&"ab".repeat(15)).is_none());
        assert!(SpanId::parse_hex(&"zz".repeat(8)).is_none());
    }

    #[test]
    fn test_path_params_lookup_is_ordered() {
        let params = PathParams(vec![
            ("id".into(), "1".into()),
            ("id".into(), "2".into()),
        ]);
        // First registration wins on duplicate names.
        assert_eq!(params.get("id"), Some("1"));
        assert_eq!(params.get("missing"), None);
    }

    fn test_request(endpoint: &str) -> Arc<Request> {
        Arc::new(Request {
            trace_id: TraceId::generate(),
            span_id: SpanId::generate(),
            parent_span_id: None,
            typ: RequestType::ApiCall,
            service: "svc".into(),
            endpoint: endpoint.into(),
            started_at: SystemTime::now(),
            start: Instant::now(),
            traced: false,
            span: tracing::Span::none(),
            payload: None,
            path_params: PathParams::default(),
            caller: None,
            auth_uid: None,
            auth_data: None,
        })
    }

    #[tokio::test]
    async fn test_current_request_nesting() {
        assert!(current_request().is_none());

        let stack = RequestStack::new();
        stack
            .clone()
            .scope(async move {
                let outer = test_request("Outer");
                let scope = RequestStack::current().unwrap();
                scope.push(outer.clone());
                assert_eq!(current_request().unwrap().endpoint, "Outer");

                let inner = test_request("Inner");
                scope.push(inner);
                assert_eq!(current_request().unwrap().endpoint, "Inner");

                scope.pop();
                assert_eq!(current_request().unwrap().endpoint, "Outer");
                scope.pop();
                assert!(current_request().is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn test_stack_shared_across_spawned_task() {
        let stack = RequestStack::new();
        let req = test_request("Shared");
        stack.push(req);

        let handle = tokio::spawn(stack.clone().scope(async move {
            current_request().map(|r| r.endpoint.clone())
        }));
        assert_eq!(handle.await.unwrap().as_deref(), Some("Shared"));
    }
}
