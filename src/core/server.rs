//! Request orchestrator.
//!
//! Owns the route tables, picks public vs private routing for every inbound
//! request, serves the reserved internal surface (health, pub/sub push
//! delivery, remote auth), reverse-proxies endpoints hosted by peer instances
//! when acting as a gateway, and counts in-flight requests so shutdown knows
//! when draining is complete.
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Instant, SystemTime},
};

use axum::{
    body::Body,
    http::{
        HeaderValue, Request as HttpRequest, StatusCode, header, request::Parts,
    },
    response::Response as HttpResponse,
};
use chrono::Utc;
use eyre::{Context, Result};
use futures_util::FutureExt;
use http_body_util::BodyExt;

use crate::{
    adapters::{
        call_meta::{CORRELATION_ID, MetaCodec, REQUEST_ID, TRACE_ID_RESPONSE},
        http_client::HttpClientAdapter,
    },
    config::RuntimeConfig,
    core::{
        auth::{AuthPayload, Authenticator},
        caller::Caller,
        desc::{
            ApiEndpoint, DispatchContext, EndpointEntry, empty_response, error_response,
            in_request_scope, json_response, outbound_caller,
        },
        middleware::Middleware,
        model::{
            AuthVerdict, CallMeta, InternalCallMeta, PathParams, Request, RequestStack,
            RequestType, Response as ModelResponse, SpanId, TraceId, current_request,
        },
        registry::Registry,
        router::{PathRouter, RouteLookup},
    },
    error::ApiError,
    ports::{http_client::HttpClient, trace::{LogTracer, Tracer}},
};

/// Reserved path prefix for the runtime's own surface.
pub const INTERNAL_PREFIX: &str = "/__encore";

/// Maximum length of echoed request/correlation id headers.
const MAX_ID_LEN: usize = 64;

type Routes = PathRouter<Arc<dyn ApiEndpoint>>;

/// Builds a [`Server`] from configuration and registered handlers.
pub struct ServerBuilder {
    config: RuntimeConfig,
    tracer: Arc<dyn Tracer>,
    registry: Arc<Registry>,
    global_middleware: Vec<Middleware>,
    service_middleware: HashMap<String, Vec<Middleware>>,
    authenticator: Option<Authenticator>,
    http_client: Option<Arc<dyn HttpClient>>,
}

impl ServerBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            tracer: Arc::new(LogTracer),
            registry: Registry::new(),
            global_middleware: Vec::new(),
            service_middleware: HashMap::new(),
            authenticator: None,
            http_client: None,
        }
    }

    /// The registry endpoints and subscriptions are registered into.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Append a middleware that runs for every endpoint.
    pub fn middleware(mut self, mw: Middleware) -> Self {
        self.global_middleware.push(mw);
        self
    }

    /// Append a middleware that runs for one service's endpoints, after the
    /// global chain.
    pub fn service_middleware(mut self, service: impl Into<String>, mw: Middleware) -> Self {
        self.service_middleware.entry(service.into()).or_default().push(mw);
        self
    }

    pub fn authenticator(mut self, auth: Authenticator) -> Self {
        self.authenticator = Some(auth);
        self
    }

    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn build(self) -> Result<Arc<Server>> {
        let codec = MetaCodec::new(
            self.config.svc_auth.to_svc_auth()?,
            self.config
                .platform_keys
                .iter()
                .map(|k| k.to_platform_key())
                .collect::<Result<Vec<_>>>()?,
        );
        let http_client: Arc<dyn HttpClient> = match self.http_client {
            Some(client) => client,
            None => Arc::new(HttpClientAdapter::new()?),
        };

        let mut public = Routes::new();
        let mut public_fallback = Routes::new();
        let mut private = Routes::new();
        let mut private_fallback = Routes::new();
        for endpoint in self.registry.endpoints() {
            let entry = endpoint.entry().clone();
            for method in &entry.methods {
                let (private_router, public_router) = if entry.fallback {
                    (&mut private_fallback, &mut public_fallback)
                } else {
                    (&mut private, &mut public)
                };
                private_router
                    .register(method, &entry.path, endpoint.clone())
                    .with_context(|| format!("registering {}", entry.name()))?;
                if entry.expose {
                    public_router
                        .register(method, &entry.path, endpoint.clone())
                        .with_context(|| format!("registering {}", entry.name()))?;
                }
            }
        }

        let global_chain: Arc<[Middleware]> = Arc::from(self.global_middleware);
        let mut service_chains = HashMap::new();
        for (service, chain) in self.service_middleware {
            let combined: Vec<Middleware> = global_chain
                .iter()
                .cloned()
                .chain(chain)
                .collect();
            service_chains.insert(service, Arc::from(combined));
        }

        Ok(Arc::new(Server {
            config: self.config,
            codec,
            tracer: self.tracer,
            registry: self.registry,
            global_chain,
            service_chains,
            authenticator: self.authenticator,
            http_client,
            public,
            public_fallback,
            private,
            private_fallback,
            in_flight: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
            draining: AtomicBool::new(false),
        }))
    }
}

pub struct Server {
    config: RuntimeConfig,
    codec: MetaCodec,
    tracer: Arc<dyn Tracer>,
    registry: Arc<Registry>,
    global_chain: Arc<[Middleware]>,
    service_chains: HashMap<String, Arc<[Middleware]>>,
    authenticator: Option<Authenticator>,
    http_client: Arc<dyn HttpClient>,
    public: Routes,
    public_fallback: Routes,
    private: Routes,
    private_fallback: Routes,
    in_flight: AtomicU64,
    healthy: AtomicBool,
    draining: AtomicBool,
}

impl Server {
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn codec(&self) -> &MetaCodec {
        &self.codec
    }

    pub fn tracer(&self) -> &Arc<dyn Tracer> {
        &self.tracer
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn authenticator(&self) -> Option<&Authenticator> {
        self.authenticator.as_ref()
    }

    pub fn http_client(&self) -> &Arc<dyn HttpClient> {
        &self.http_client
    }

    /// The middleware chain for one service: global layers then service
    /// layers.
    pub fn chain_for(&self, service: &str) -> Arc<[Middleware]> {
        self.service_chains
            .get(service)
            .cloned()
            .unwrap_or_else(|| self.global_chain.clone())
    }

    /// Metadata for an outbound call made from the current execution context.
    pub fn next_call_meta(&self) -> CallMeta {
        let caller = outbound_caller(&self.config.app.deploy_id);
        match current_request() {
            Some(req) => CallMeta {
                trace_id: req.trace_id,
                parent_span_id: Some(req.span_id),
                parent_event_id: None,
                traced: req.traced,
                internal: Some(InternalCallMeta {
                    caller,
                    auth_uid: req.auth_uid.clone(),
                    auth_data: req
                        .auth_data
                        .as_ref()
                        .and_then(|d| d.downcast_ref::<serde_json::Value>().cloned()),
                }),
            },
            None => {
                let mut meta = CallMeta::new_root();
                meta.internal = Some(InternalCallMeta {
                    caller,
                    auth_uid: None,
                    auth_data: None,
                });
                meta
            }
        }
    }

    /// Flip the health surface to unhealthy. Called as soon as a termination
    /// signal arrives, before connections are refused, so load balancers can
    /// start rerouting.
    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::SeqCst);
    }

    /// Stop serving: every new request is answered 503 with a retry hint.
    pub fn mark_draining(&self) {
        self.healthy.store(false, Ordering::SeqCst);
        self.draining.store(true, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Requests currently being handled.
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Serve one inbound request.
    pub async fn handle(self: &Arc<Self>, req: HttpRequest<Body>) -> HttpResponse {
        if self.is_draining() {
            let mut resp =
                error_response(&ApiError::unavailable("server is shutting down"), false, None);
            resp.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
            return resp;
        }
        let _guard = InFlightGuard::acquire(self);

        let (mut parts, body) = req.into_parts();
        let raw_path = parts.uri.path().to_string();
        let inbound_request_id = parts.headers.get(&REQUEST_ID).and_then(clamp_id);
        let inbound_correlation_id = parts.headers.get(&CORRELATION_ID).and_then(clamp_id);

        // A valid platform signature grants private routing on its own.
        let platform = self.codec.verify_platform(&mut parts.headers, &raw_path, Utc::now());
        let meta = match self.codec.parse_inbound(&parts.headers) {
            Ok(meta) => meta,
            Err(err) => {
                let resp = error_response(&err, false, None);
                return apply_identity_headers(resp, None, inbound_request_id, inbound_correlation_id);
            }
        };

        let resp = self
            .route(parts, body, &raw_path, meta.clone(), platform)
            .await;
        apply_identity_headers(
            resp,
            Some(&meta),
            inbound_request_id,
            inbound_correlation_id,
        )
    }

    async fn route(
        self: &Arc<Self>,
        parts: Parts,
        body: Body,
        raw_path: &str,
        meta: CallMeta,
        platform: bool,
    ) -> HttpResponse {
        if let Some(rest) = raw_path.strip_prefix(INTERNAL_PREFIX) {
            return self.serve_internal(rest, parts, body, meta).await;
        }

        let internal = platform || meta.internal.is_some();
        let private_capable = platform || meta.private_routes();
        let (primary, fallback) = if private_capable {
            (&self.private, &self.private_fallback)
        } else {
            (&self.public, &self.public_fallback)
        };

        // The fallback pair is only consulted when the primary misses
        // entirely; a trailing-slash redirect counts as a hit.
        let lookup = match primary.lookup(&parts.method, raw_path) {
            RouteLookup::NotFound => fallback.lookup(&parts.method, raw_path),
            hit => hit,
        };

        match lookup {
            RouteLookup::Found { handler, params } => {
                let entry = handler.entry();
                if !self.config.hosts_service(&entry.service) {
                    // Only gateway instances proxy endpoints hosted elsewhere.
                    if self.config.is_gateway() {
                        return self.proxy(entry, parts, body, meta, internal).await;
                    }
                    return error_response(
                        &ApiError::not_found("endpoint not found"),
                        internal,
                        None,
                    );
                }
                let ctx = DispatchContext {
                    server: self.clone(),
                    meta,
                    internal,
                    params,
                    parts,
                    body,
                };
                handler.dispatch(ctx).await
            }
            RouteLookup::Redirect { status, location } => redirect_response(status, &location),
            RouteLookup::NotFound => {
                error_response(&ApiError::not_found("endpoint not found"), internal, None)
            }
        }
    }

    /// Reverse-proxy a request to the peer instance hosting the target
    /// service, injecting callee identity and call metadata.
    async fn proxy(
        &self,
        entry: &EndpointEntry,
        parts: Parts,
        body: Body,
        meta: CallMeta,
        internal: bool,
    ) -> HttpResponse {
        let Some(base) = self.config.service_url(&entry.service) else {
            return error_response(
                &ApiError::unavailable(format!(
                    "no address known for service {}",
                    entry.service
                )),
                internal,
                None,
            );
        };
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", base.trim_end_matches('/'), path_and_query);

        let mut out_meta = meta;
        out_meta.internal = Some(InternalCallMeta {
            caller: Caller::Gateway {
                service: entry.service.clone(),
                endpoint: entry.endpoint.clone(),
            },
            auth_uid: out_meta.internal.as_ref().and_then(|i| i.auth_uid.clone()),
            auth_data: out_meta.internal.as_ref().and_then(|i| i.auth_data.clone()),
        });

        let mut out = match HttpRequest::builder()
            .method(parts.method.clone())
            .uri(&url)
            .body(body)
        {
            Ok(out) => out,
            Err(e) => {
                return error_response(
                    &ApiError::internal(format!("building proxy request failed: {e}")),
                    internal,
                    None,
                );
            }
        };
        *out.headers_mut() = parts.headers;
        if let Err(err) = self.codec.add_to_request(
            &out_meta,
            SpanId::generate(),
            &entry.service,
            out.headers_mut(),
        ) {
            return error_response(&err, internal, None);
        }

        match self.http_client.send_request(out).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(
                    service = %entry.service,
                    endpoint = %entry.endpoint,
                    error = %e,
                    "proxying request failed"
                );
                error_response(
                    &ApiError::unavailable(format!("proxy to {} failed: {e}", entry.name())),
                    internal,
                    None,
                )
            }
        }
    }

    /// The reserved internal surface under [`INTERNAL_PREFIX`].
    async fn serve_internal(
        self: &Arc<Self>,
        rest: &str,
        parts: Parts,
        body: Body,
        meta: CallMeta,
    ) -> HttpResponse {
        let internal = meta.internal.is_some();
        match rest {
            "/healthz" => self.healthz(),
            "/authhandler" => self.remote_auth(parts, body, meta).await,
            _ => {
                if let Some(sub_id) = rest.strip_prefix("/pubsub/push/") {
                    return self.pubsub_push(sub_id, body, meta).await;
                }
                if rest == "/pubsub/push" || rest == "/pubsub/push/" {
                    // Push URL without a subscription id segment.
                    return error_response(
                        &ApiError::invalid_argument("missing subscription id"),
                        internal,
                        None,
                    );
                }
                error_response(&ApiError::not_found("endpoint not found"), internal, None)
            }
        }
    }

    fn healthz(&self) -> HttpResponse {
        let healthy = self.healthy.load(Ordering::SeqCst);
        let (code, message, status) = if healthy {
            ("ok", "api server running", StatusCode::OK)
        } else {
            ("unhealthy", "api server shutting down", StatusCode::SERVICE_UNAVAILABLE)
        };
        let body = serde_json::json!({
            "code": code,
            "message": message,
            "details": {
                "app_revision": self.config.app.app_revision,
                "compiler_version": self.config.app.compiler_version,
                "deploy_id": self.config.app.deploy_id,
                "checks": [],
                "enabled_experiments": self.config.app.enabled_experiments,
            },
        });
        json_response(
            status,
            serde_json::to_vec(&body).unwrap_or_default().into(),
            None,
        )
    }

    /// Serve a forwarded auth request from a peer instance whose auth handler
    /// lives here.
    async fn remote_auth(
        self: &Arc<Self>,
        _parts: Parts,
        body: Body,
        meta: CallMeta,
    ) -> HttpResponse {
        // Only reachable over verified service-to-service transport.
        if meta.internal.is_none() {
            return error_response(
                &ApiError::permission_denied("auth forwarding requires service auth"),
                false,
                None,
            );
        }
        let Some(authenticator) = self.authenticator.as_ref().filter(|a| a.is_local()) else {
            return error_response(
                &ApiError::not_found("no auth handler hosted here"),
                true,
                None,
            );
        };

        let bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return error_response(
                    &ApiError::invalid_argument(format!("reading auth payload failed: {e}")),
                    true,
                    None,
                );
            }
        };
        let payload: AuthPayload = match serde_json::from_slice(&bytes) {
            Ok(p) => p,
            Err(_) => {
                return error_response(
                    &ApiError::invalid_argument("malformed auth payload"),
                    true,
                    None,
                );
            }
        };

        match in_request_scope(authenticator.authenticate(self, &meta, payload)).await {
            Ok(outcome) => {
                let verdict = AuthVerdict {
                    uid: outcome.uid,
                    user_data: outcome.user_data,
                };
                let bytes = serde_json::to_vec(&verdict).unwrap_or_default();
                json_response(StatusCode::OK, bytes.into(), None)
            }
            Err(err) => error_response(&err, true, None),
        }
    }

    /// Deliver a pushed pub/sub message to its registered subscription
    /// callback.
    async fn pubsub_push(self: &Arc<Self>, sub_id: &str, body: Body, meta: CallMeta) -> HttpResponse {
        let internal = meta.internal.is_some();
        if sub_id.is_empty() {
            return error_response(
                &ApiError::invalid_argument("missing subscription id"),
                internal,
                None,
            );
        }
        let Some(handler) = self.registry.subscription(sub_id) else {
            return error_response(
                &ApiError::not_found(format!("unknown subscription {sub_id}")),
                internal,
                None,
            );
        };

        let bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return error_response(
                    &ApiError::invalid_argument(format!("reading message failed: {e}")),
                    internal,
                    None,
                );
            }
        };
        let message: serde_json::Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(_) => {
                return error_response(
                    &ApiError::invalid_argument("malformed message payload"),
                    internal,
                    None,
                );
            }
        };

        let span = tracing::info_span!(
            "pubsub_push",
            subscription = %sub_id,
            trace_id = %meta.trace_id,
        );
        let req = Arc::new(Request {
            trace_id: meta.trace_id,
            span_id: SpanId::generate(),
            parent_span_id: meta.parent_span_id,
            typ: RequestType::PubSubMessage,
            service: "pubsub".to_string(),
            endpoint: sub_id.to_string(),
            started_at: SystemTime::now(),
            start: Instant::now(),
            traced: meta.traced,
            span,
            payload: Some(message.clone()),
            path_params: PathParams::default(),
            caller: meta.internal.as_ref().map(|i| i.caller.clone()),
            auth_uid: None,
            auth_data: None,
        });

        let tracer = self.tracer.clone();
        let result = in_request_scope(async move {
            let stack = RequestStack::current().unwrap_or_default();
            stack.push(req.clone());
            tracer.begin_request(&req);

            let result = std::panic::AssertUnwindSafe(handler(message))
                .catch_unwind()
                .await
                .unwrap_or_else(|p| Err(ApiError::from_panic(p.as_ref())));

            let (status, error) = match &result {
                Ok(()) => (StatusCode::OK, None),
                Err(err) => (err.http_status(), Some(err.clone())),
            };
            tracer.finish_request(
                &req,
                &ModelResponse {
                    status,
                    error,
                    payload: None,
                    captured_request: None,
                    captured_response: None,
                    extra_headers: None,
                    duration: req.duration(),
                },
            );
            stack.pop();
            result
        })
        .await;

        match result {
            Ok(()) => json_response(StatusCode::OK, bytes::Bytes::from_static(b"{}"), None),
            Err(err) => error_response(&err, internal, None),
        }
    }
}

/// RAII in-flight counter.
struct InFlightGuard {
    server: Arc<Server>,
}

impl InFlightGuard {
    fn acquire(server: &Arc<Server>) -> Self {
        server.in_flight.fetch_add(1, Ordering::SeqCst);
        Self {
            server: server.clone(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.server.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn clamp_id(value: &HeaderValue) -> Option<String> {
    let s = value.to_str().ok()?.trim();
    if s.is_empty() {
        return None;
    }
    Some(s.chars().take(MAX_ID_LEN).collect())
}

fn apply_identity_headers(
    mut resp: HttpResponse,
    meta: Option<&CallMeta>,
    request_id: Option<String>,
    correlation_id: Option<String>,
) -> HttpResponse {
    let headers = resp.headers_mut();
    // No inbound id: derive one from the trace id so the two correlate.
    let request_id = request_id.unwrap_or_else(|| match meta {
        Some(meta) => meta.trace_id.to_string(),
        None => TraceId::generate().to_string(),
    });
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(REQUEST_ID, value);
    }
    if let Some(correlation_id) = correlation_id {
        if let Ok(value) = HeaderValue::from_str(&correlation_id) {
            headers.insert(CORRELATION_ID, value);
        }
    }
    if let Some(meta) = meta {
        if let Ok(value) = HeaderValue::from_str(&meta.trace_id.to_string()) {
            headers.insert(TRACE_ID_RESPONSE, value);
        }
    }
    resp
}

fn redirect_response(status: StatusCode, location: &str) -> HttpResponse {
    let mut resp = empty_response(status);
    match HeaderValue::from_str(location) {
        Ok(value) => {
            resp.headers_mut().insert(header::LOCATION, value);
            resp
        }
        Err(_) => error_response(
            &ApiError::internal("redirect location is not a valid header value"),
            false,
            None,
        ),
    }
}
