//! Per-endpoint descriptors and the dispatch state machine.
//!
//! An [`EndpointDesc`] is the compiled execution plan for one typed endpoint:
//! request decode, access control, the middleware chain, the application
//! handler, response encode, and request-tracking bookkeeping. The state
//! machine guarantees the pairing invariant: every request whose tracking
//! began is finished exactly once, and a request whose payload could not even
//! be extracted is answered without ever starting a span.
//!
//! [`RawEndpoint`] covers raw passthrough handlers that speak HTTP directly;
//! they skip typed encode/decode but share auth, tracking and body capture.
use std::{
    any::Any,
    sync::{Arc, Mutex, OnceLock},
    time::{Instant, SystemTime},
};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Method, StatusCode, header, request::Parts},
    response::Response as HttpResponse,
};
use bytes::Bytes;
use futures_util::{FutureExt, future::BoxFuture};
use http_body_util::BodyExt;
use serde::{Serialize, de::DeserializeOwned};
use tracing::Instrument;

use crate::{
    adapters::{
        call_meta::{FULL_ERROR, META_CALLEE},
        capture::{BodyCapture, CapturedStream},
    },
    core::{
        auth,
        middleware::{ChainHandler, MwContext, MwResponse, run_chain},
        model::{
            CallMeta, PathParams, Request, RequestStack, RequestType, Response, SpanId,
            current_request,
        },
        server::Server,
    },
    error::{ApiError, ApiResult, ErrCode},
};

/// Access policy of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Callable by anyone.
    Public,
    /// Callable by anyone presenting valid auth credentials.
    RequiresAuth,
    /// Callable only by other services in the app (and the platform).
    Private,
}

/// Registration-time identity and routing data of one endpoint.
#[derive(Debug, Clone)]
pub struct EndpointEntry {
    pub service: String,
    pub endpoint: String,
    pub access: Access,
    /// Whether the endpoint is reachable through the public router at all.
    pub expose: bool,
    /// HTTP methods; `*` matches any method.
    pub methods: Vec<String>,
    /// Path pattern with `:name` and `*name` segments.
    pub path: String,
    pub raw: bool,
    /// Fallback endpoints are only consulted when every primary route misses.
    pub fallback: bool,
}

impl EndpointEntry {
    pub fn name(&self) -> String {
        format!("{}.{}", self.service, self.endpoint)
    }
}

/// Reflected endpoint descriptor, computed at most once per endpoint.
#[derive(Debug, Clone)]
pub struct RpcDesc {
    pub service: String,
    pub endpoint: String,
    pub requires_auth: bool,
    pub exposed: bool,
    pub request_schema: &'static str,
    pub response_schema: &'static str,
}

/// Everything the orchestrator hands to an endpoint for one request.
pub struct DispatchContext {
    pub server: Arc<Server>,
    pub meta: CallMeta,
    /// Whether the caller may see full-fidelity error bodies.
    pub internal: bool,
    pub params: PathParams,
    pub parts: Parts,
    pub body: Body,
}

/// Type-erased endpoint interface the routers store.
#[async_trait]
pub trait ApiEndpoint: Send + Sync + 'static {
    fn entry(&self) -> &EndpointEntry;
    fn rpc_desc(&self) -> &RpcDesc;
    async fn dispatch(&self, ctx: DispatchContext) -> HttpResponse;
}

/// The application handler of a typed endpoint. Reads request context through
/// `current_request()`.
pub type TypedHandler<Req, Resp> =
    Arc<dyn Fn(Req) -> BoxFuture<'static, ApiResult<Resp>> + Send + Sync>;

/// A test double for one endpoint, stored type-erased in the registry and
/// downcast back at call time.
pub type MockHandler<Req, Resp> = TypedHandler<Req, Resp>;

/// Wrap a mock closure for registry storage.
pub fn erase_mock<Req, Resp>(handler: MockHandler<Req, Resp>) -> Arc<dyn Any + Send + Sync>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    Arc::new(handler)
}

/// Compiled execution plan for one typed endpoint.
pub struct EndpointDesc<Req, Resp> {
    entry: EndpointEntry,
    handler: TypedHandler<Req, Resp>,
    rpc: OnceLock<RpcDesc>,
}

impl<Req, Resp> EndpointDesc<Req, Resp>
where
    Req: Serialize + DeserializeOwned + Send + Sync + 'static,
    Resp: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(entry: EndpointEntry, handler: TypedHandler<Req, Resp>) -> Arc<Self> {
        debug_assert!(!entry.raw, "typed endpoint registered as raw");
        Arc::new(Self {
            entry,
            handler,
            rpc: OnceLock::new(),
        })
    }

    /// Call this endpoint from application code.
    ///
    /// Resolution order: a registered mock wins, then in-process execution
    /// when the target service is hosted here, otherwise the call is
    /// marshalled to an HTTP request against the service-discovery address.
    /// In-process execution runs on its own task so a panicking callee cannot
    /// unwind the caller.
    pub async fn call(self: &Arc<Self>, server: &Arc<Server>, payload: Req) -> ApiResult<Resp> {
        if let Some(mock) = server
            .registry()
            .mock_for(&self.entry.service, &self.entry.endpoint)
        {
            let Some(handler) = mock.handler.downcast_ref::<MockHandler<Req, Resp>>() else {
                return Err(ApiError::internal(format!(
                    "mock for {} has the wrong type",
                    self.entry.name()
                )));
            };
            let handler = handler.clone();
            if mock.run_middleware {
                let meta = server.next_call_meta();
                let this = self.clone();
                let server = server.clone();
                return spawn_isolated(async move {
                    this.execute_local(server, meta, payload, handler).await
                })
                .await;
            }
            return spawn_isolated(async move { handler(payload).await }).await;
        }

        let meta = server.next_call_meta();
        if server.config().hosts_service(&self.entry.service) {
            let this = self.clone();
            let server = server.clone();
            let handler = self.handler.clone();
            spawn_isolated(async move { this.execute_local(server, meta, payload, handler).await })
                .await
        } else {
            self.call_remote(server, meta, payload).await
        }
    }

    /// Run the full local pipeline (access check, tracking, middleware,
    /// handler) for an in-process call.
    async fn execute_local(
        self: Arc<Self>,
        server: Arc<Server>,
        meta: CallMeta,
        payload: Req,
        handler: TypedHandler<Req, Resp>,
    ) -> ApiResult<Resp> {
        let payload_value = serde_json::to_value(&payload)
            .map_err(|e| ApiError::internal(format!("request payload encoding failed: {e}")))?;
        if matches!(self.entry.access, Access::RequiresAuth)
            && meta
                .internal
                .as_ref()
                .and_then(|i| i.auth_uid.as_ref())
                .is_none()
        {
            return Err(ApiError::unauthenticated("endpoint requires auth"));
        }

        let req = self.build_request(&meta, payload_value, PathParams::default(), None);
        let stack = RequestStack::current().unwrap_or_default();
        stack.push(req.clone());
        server.tracer().begin_request(&req);

        let chain = server.chain_for(&self.entry.service);
        let mw_resp = run_chain(
            chain,
            typed_chain_handler(handler, payload),
            MwContext { req: req.clone() },
        )
        .instrument(req.span.clone())
        .await;

        let result = mw_resp
            .result
            .and_then(|value| typed_response::<Resp>(value));
        let (status, error, payload_bytes) = match &result {
            Ok((_, bytes)) => (StatusCode::OK, None, Some(bytes.clone())),
            Err(err) => (err.http_status(), Some(err.clone()), None),
        };
        server.tracer().finish_request(
            &req,
            &Response {
                status,
                error,
                payload: payload_bytes,
                captured_request: None,
                captured_response: None,
                extra_headers: Some(mw_resp.headers),
                duration: req.duration(),
            },
        );
        stack.pop();

        result.map(|(resp, _)| resp)
    }

    /// Marshal the call to an HTTP request against the peer instance hosting
    /// the target service.
    async fn call_remote(
        &self,
        server: &Arc<Server>,
        meta: CallMeta,
        payload: Req,
    ) -> ApiResult<Resp> {
        let base = server
            .config()
            .service_url(&self.entry.service)
            .ok_or_else(|| {
                ApiError::unavailable(format!(
                    "no address known for service {}",
                    self.entry.service
                ))
            })?;
        let url = format!("{}{}", base.trim_end_matches('/'), self.entry.path);
        let method = self
            .entry
            .methods
            .iter()
            .find(|m| *m != "*")
            .map(String::as_str)
            .unwrap_or("POST");

        let body = serde_json::to_vec(&payload)
            .map_err(|e| ApiError::internal(format!("request payload encoding failed: {e}")))?;
        let mut out = axum::http::Request::builder()
            .method(Method::from_bytes(method.as_bytes()).unwrap_or(Method::POST))
            .uri(&url)
            .body(Body::from(body))
            .map_err(|e| ApiError::internal(format!("building outbound request failed: {e}")))?;
        out.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        server.codec().add_to_request(
            &meta,
            SpanId::generate(),
            &self.entry.service,
            out.headers_mut(),
        )?;

        let resp = server
            .http_client()
            .send_request(out)
            .await
            .map_err(|e| ApiError::unavailable(format!("call to {} failed: {e}", self.entry.name())))?;

        let (parts, body) = resp.into_parts();
        let bytes = body
            .collect()
            .await
            .map_err(|e| ApiError::unavailable(format!("reading peer response failed: {e}")))?
            .to_bytes();

        if parts.status.is_success() {
            serde_json::from_slice(&bytes).map_err(|e| {
                ApiError::internal(format!(
                    "decoding response from {} failed: {e}",
                    self.entry.name()
                ))
            })
        } else if parts.headers.contains_key(&FULL_ERROR) {
            Err(ApiError::from_internal_body(&bytes)
                .unwrap_or_else(|_| ApiError::from_http_status(parts.status)))
        } else {
            Err(ApiError::from_http_status(parts.status))
        }
    }

    fn build_request(
        &self,
        meta: &CallMeta,
        payload: serde_json::Value,
        params: PathParams,
        auth: Option<auth::AuthOutcome>,
    ) -> Arc<Request> {
        let (auth_uid, auth_data) = match auth {
            Some(outcome) => (
                Some(outcome.uid),
                outcome
                    .user_data
                    .map(|v| Arc::new(v) as Arc<dyn Any + Send + Sync>),
            ),
            None => match &meta.internal {
                Some(i) => (
                    i.auth_uid.clone(),
                    i.auth_data
                        .clone()
                        .map(|v| Arc::new(v) as Arc<dyn Any + Send + Sync>),
                ),
                None => (None, None),
            },
        };
        let span = tracing::info_span!(
            "api_call",
            service = %self.entry.service,
            endpoint = %self.entry.endpoint,
            trace_id = %meta.trace_id,
        );
        Arc::new(Request {
            trace_id: meta.trace_id,
            span_id: SpanId::generate(),
            parent_span_id: meta.parent_span_id,
            typ: RequestType::ApiCall,
            service: self.entry.service.clone(),
            endpoint: self.entry.endpoint.clone(),
            started_at: SystemTime::now(),
            start: Instant::now(),
            traced: meta.traced,
            span,
            payload: Some(payload),
            path_params: params,
            caller: meta.internal.as_ref().map(|i| i.caller.clone()),
            auth_uid,
            auth_data,
        })
    }
}

#[async_trait]
impl<Req, Resp> ApiEndpoint for EndpointDesc<Req, Resp>
where
    Req: Serialize + DeserializeOwned + Send + Sync + 'static,
    Resp: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn entry(&self) -> &EndpointEntry {
        &self.entry
    }

    fn rpc_desc(&self) -> &RpcDesc {
        self.rpc.get_or_init(|| RpcDesc {
            service: self.entry.service.clone(),
            endpoint: self.entry.endpoint.clone(),
            requires_auth: matches!(self.entry.access, Access::RequiresAuth),
            exposed: self.entry.expose,
            request_schema: std::any::type_name::<Req>(),
            response_schema: std::any::type_name::<Resp>(),
        })
    }

    async fn dispatch(&self, ctx: DispatchContext) -> HttpResponse {
        in_request_scope(self.dispatch_http(ctx)).await
    }
}

impl<Req, Resp> EndpointDesc<Req, Resp>
where
    Req: Serialize + DeserializeOwned + Send + Sync + 'static,
    Resp: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn dispatch_http(&self, ctx: DispatchContext) -> HttpResponse {
        let DispatchContext {
            server,
            meta,
            internal,
            params,
            parts,
            body,
        } = ctx;

        if let Err(err) = verify_callee(&meta, &parts.headers, &self.entry.service) {
            return error_response(&err, internal, None);
        }

        // Mirror body bytes for trace attachment while reading.
        let capture = BodyCapture::for_request(&parts.headers);
        let bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                let err = ApiError::invalid_argument(format!("reading request body failed: {e}"));
                return error_response(&err, internal, None);
            }
        };
        capture.write(&bytes);
        let captured_request = capture.finish();

        // A payload we cannot even parse as JSON means no span is ever
        // started: answer 400 with an empty body directly.
        let payload_value: serde_json::Value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            match serde_json::from_slice(&bytes) {
                Ok(v) => v,
                Err(_) => return empty_response(StatusCode::BAD_REQUEST),
            }
        };
        // A well-formed payload of the wrong shape still gets a span; the
        // decode error travels through finalization like any handler error.
        let typed: ApiResult<Req> = serde_json::from_value(payload_value.clone())
            .map_err(|e| ApiError::invalid_argument(format!("invalid request payload: {e}")));

        let requires_auth = matches!(self.entry.access, Access::RequiresAuth);
        let auth_outcome =
            match auth::resolve(&server, &meta, &parts.headers, requires_auth).await {
                Ok(outcome) => outcome,
                Err(err) => return error_response(&err, internal, None),
            };

        let req = self.build_request(&meta, payload_value, params, auth_outcome);
        let stack = RequestStack::current().unwrap_or_default();
        stack.push(req.clone());
        server.tracer().begin_request(&req);

        let mw_resp = match typed {
            Ok(payload) => {
                run_chain(
                    server.chain_for(&self.entry.service),
                    typed_chain_handler(self.handler.clone(), payload),
                    MwContext { req: req.clone() },
                )
                .instrument(req.span.clone())
                .await
            }
            Err(decode_err) => MwResponse::err(decode_err),
        };

        let encoded = mw_resp.result.and_then(|value| {
            serde_json::to_vec(&value)
                .map(Bytes::from)
                .map_err(|e| ApiError::internal(format!("response encoding failed: {e}")))
        });
        let (status, error, payload_bytes) = match &encoded {
            Ok(bytes) => (StatusCode::OK, None, Some(bytes.clone())),
            Err(err) => (err.http_status(), Some(err.clone()), None),
        };
        server.tracer().finish_request(
            &req,
            &Response {
                status,
                error: error.clone(),
                payload: payload_bytes.clone(),
                captured_request,
                captured_response: None,
                extra_headers: Some(mw_resp.headers.clone()),
                duration: req.duration(),
            },
        );
        stack.pop();

        match encoded {
            Ok(bytes) => json_response(StatusCode::OK, bytes, Some(&mw_resp.headers)),
            Err(err) => error_response(&err, internal, Some(&mw_resp.headers)),
        }
    }
}

/// Raw passthrough endpoint: the handler speaks HTTP directly.
pub struct RawEndpoint {
    entry: EndpointEntry,
    handler: RawHandler,
    rpc: OnceLock<RpcDesc>,
}

pub type RawHandler = Arc<
    dyn Fn(axum::http::Request<Body>) -> BoxFuture<'static, ApiResult<HttpResponse>>
        + Send
        + Sync,
>;

impl RawEndpoint {
    pub fn new(mut entry: EndpointEntry, handler: RawHandler) -> Arc<Self> {
        entry.raw = true;
        Arc::new(Self {
            entry,
            handler,
            rpc: OnceLock::new(),
        })
    }

    async fn dispatch_http(&self, ctx: DispatchContext) -> HttpResponse {
        let DispatchContext {
            server,
            meta,
            internal,
            params,
            parts,
            body,
        } = ctx;

        if let Err(err) = verify_callee(&meta, &parts.headers, &self.entry.service) {
            return error_response(&err, internal, None);
        }

        let requires_auth = matches!(self.entry.access, Access::RequiresAuth);
        let auth_outcome =
            match auth::resolve(&server, &meta, &parts.headers, requires_auth).await {
                Ok(outcome) => outcome,
                Err(err) => return error_response(&err, internal, None),
            };

        let (auth_uid, auth_data) = match auth_outcome {
            Some(outcome) => (
                Some(outcome.uid),
                outcome
                    .user_data
                    .map(|v| Arc::new(v) as Arc<dyn Any + Send + Sync>),
            ),
            None => (
                meta.internal.as_ref().and_then(|i| i.auth_uid.clone()),
                None,
            ),
        };
        let span = tracing::info_span!(
            "raw_call",
            service = %self.entry.service,
            endpoint = %self.entry.endpoint,
            trace_id = %meta.trace_id,
        );
        let req = Arc::new(Request {
            trace_id: meta.trace_id,
            span_id: SpanId::generate(),
            parent_span_id: meta.parent_span_id,
            typ: RequestType::ApiCall,
            service: self.entry.service.clone(),
            endpoint: self.entry.endpoint.clone(),
            started_at: SystemTime::now(),
            start: Instant::now(),
            traced: meta.traced,
            span,
            payload: None,
            path_params: params,
            caller: meta.internal.as_ref().map(|i| i.caller.clone()),
            auth_uid,
            auth_data,
        });
        let stack = RequestStack::current().unwrap_or_default();
        stack.push(req.clone());
        server.tracer().begin_request(&req);

        // The capturer rides the request body stream; whatever the handler
        // reads is mirrored up to the cap.
        let req_capture = BodyCapture::for_request(&parts.headers);
        let raw_req = axum::http::Request::from_parts(
            parts,
            CapturedStream::wrap(body, req_capture.clone()),
        );

        let handler = self.handler.clone();
        let outcome = std::panic::AssertUnwindSafe(handler(raw_req))
            .catch_unwind()
            .instrument(req.span.clone())
            .await
            .unwrap_or_else(|payload| Err(ApiError::from_panic(payload.as_ref())));

        let (resp, error, captured_response) = match outcome {
            Ok(resp) => {
                let (rparts, rbody) = resp.into_parts();
                let resp_capture = BodyCapture::for_response(&rparts.headers);
                match rbody.collect().await {
                    Ok(collected) => {
                        let bytes = collected.to_bytes();
                        resp_capture.write(&bytes);
                        let captured = resp_capture.finish();
                        // Raw handlers report failure through the status
                        // line; reflect it in tracking as a synthetic error.
                        let error = (rparts.status.as_u16() >= 400)
                            .then(|| ApiError::from_http_status(rparts.status));
                        (
                            HttpResponse::from_parts(rparts, Body::from(bytes)),
                            error,
                            captured,
                        )
                    }
                    Err(e) => {
                        let err =
                            ApiError::internal(format!("reading raw response body failed: {e}"));
                        (error_response(&err, internal, None), Some(err), None)
                    }
                }
            }
            Err(err) => (error_response(&err, internal, None), Some(err), None),
        };

        server.tracer().finish_request(
            &req,
            &Response {
                status: resp.status(),
                error,
                payload: None,
                captured_request: req_capture.finish(),
                captured_response,
                extra_headers: None,
                duration: req.duration(),
            },
        );
        stack.pop();
        resp
    }
}

#[async_trait]
impl ApiEndpoint for RawEndpoint {
    fn entry(&self) -> &EndpointEntry {
        &self.entry
    }

    fn rpc_desc(&self) -> &RpcDesc {
        self.rpc.get_or_init(|| RpcDesc {
            service: self.entry.service.clone(),
            endpoint: self.entry.endpoint.clone(),
            requires_auth: matches!(self.entry.access, Access::RequiresAuth),
            exposed: self.entry.expose,
            request_schema: "http",
            response_schema: "http",
        })
    }

    async fn dispatch(&self, ctx: DispatchContext) -> HttpResponse {
        in_request_scope(self.dispatch_http(ctx)).await
    }
}

/// Innermost chain link: consume the typed payload, run the handler, encode
/// the response back into the chain's wire shape.
fn typed_chain_handler<Req, Resp>(
    handler: TypedHandler<Req, Resp>,
    payload: Req,
) -> ChainHandler
where
    Req: Send + Sync + 'static,
    Resp: Serialize + Send + Sync + 'static,
{
    let slot = Arc::new(Mutex::new(Some(payload)));
    Arc::new(move |_ctx| {
        let slot = slot.clone();
        let handler = handler.clone();
        async move {
            let Some(payload) = slot.lock().ok().and_then(|mut s| s.take()) else {
                return MwResponse::err(ApiError::internal("handler invoked more than once"));
            };
            match handler(payload).await {
                Ok(resp) => match serde_json::to_value(&resp) {
                    Ok(value) => MwResponse::ok(value),
                    Err(e) => MwResponse::err(ApiError::internal(format!(
                        "response encoding failed: {e}"
                    ))),
                },
                Err(err) => MwResponse::err(err),
            }
        }
        .boxed()
    })
}

fn typed_response<Resp: DeserializeOwned>(
    value: serde_json::Value,
) -> ApiResult<(Resp, Bytes)> {
    let bytes = serde_json::to_vec(&value)
        .map(Bytes::from)
        .map_err(|e| ApiError::internal(format!("response encoding failed: {e}")))?;
    let resp = serde_json::from_value(value)
        .map_err(|e| ApiError::internal(format!("response decoding failed: {e}")))?;
    Ok((resp, bytes))
}

/// Internal calls carry the identity of the service they were aimed at; a
/// mismatch means the mesh routed the request to the wrong place.
fn verify_callee(meta: &CallMeta, headers: &HeaderMap, service: &str) -> ApiResult<()> {
    if meta.internal.is_none() {
        return Ok(());
    }
    if let Some(callee) = headers.get(&META_CALLEE) {
        let callee = callee.to_str().unwrap_or("");
        if callee != service {
            return Err(ApiError::permission_denied(format!(
                "call intended for service {callee} reached {service}"
            )));
        }
    }
    Ok(())
}

/// Run `fut` inside the current request scope, creating a fresh one for
/// top-level requests.
pub(crate) async fn in_request_scope<F: Future>(fut: F) -> F::Output {
    if RequestStack::current().is_some() {
        fut.await
    } else {
        RequestStack::new().scope(fut).await
    }
}

/// Run `fut` on its own task sharing the caller's request scope, blocking on
/// completion. A panic in the task surfaces as an Internal error instead of
/// unwinding the caller.
pub(crate) async fn spawn_isolated<T, F>(fut: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: Future<Output = ApiResult<T>> + Send + 'static,
{
    let stack = RequestStack::current().unwrap_or_default();
    match tokio::spawn(stack.scope(fut)).await {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => {
            let payload = join_err.into_panic();
            Err(ApiError::from_panic(payload.as_ref()))
        }
        Err(_) => Err(ApiError::new(ErrCode::Canceled, "call was canceled")),
    }
}

/// Identity of the caller to record for an outbound call made from the
/// current execution context.
pub(crate) fn outbound_caller(deploy_id: &str) -> crate::core::caller::Caller {
    match current_request() {
        Some(req) => crate::core::caller::Caller::Api {
            service: req.service.clone(),
            endpoint: req.endpoint.clone(),
        },
        None => crate::core::caller::Caller::App {
            deploy_id: deploy_id.to_string(),
        },
    }
}

/// Write a JSON success response.
pub fn json_response(
    status: StatusCode,
    payload: Bytes,
    extra: Option<&HeaderMap>,
) -> HttpResponse {
    let mut resp = HttpResponse::new(Body::from(payload));
    *resp.status_mut() = status;
    apply_headers(resp.headers_mut(), extra);
    resp
}

/// Write an error response: full-fidelity for internal callers (flagged with
/// a marker header), sanitized for boundary clients.
pub fn error_response(
    err: &ApiError,
    internal: bool,
    extra: Option<&HeaderMap>,
) -> HttpResponse {
    let body = if internal {
        err.to_internal_body()
    } else {
        err.to_external_body()
    };
    let mut resp = HttpResponse::new(Body::from(body));
    *resp.status_mut() = err.http_status();
    apply_headers(resp.headers_mut(), extra);
    if internal {
        resp.headers_mut()
            .insert(FULL_ERROR, HeaderValue::from_static("1"));
    }
    resp
}

/// A status-only response with no body at all.
pub fn empty_response(status: StatusCode) -> HttpResponse {
    let mut resp = HttpResponse::new(Body::empty());
    *resp.status_mut() = status;
    resp
}

fn apply_headers(headers: &mut HeaderMap, extra: Option<&HeaderMap>) {
    if let Some(extra) = extra {
        for (name, value) in extra.iter() {
            headers.append(name, value.clone());
        }
    }
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
}
