//! Auth handler execution.
//!
//! At most one auth handler exists per app. It runs on its own task with its
//! own tracking span so a panicking or slow handler never unwinds the
//! endpoint that triggered it. When the handler lives in a different service
//! instance, authentication is forwarded to that instance's reserved auth
//! endpoint and the verdict relayed; callers cannot tell the difference.
use std::{
    sync::Arc,
    time::{Instant, SystemTime},
};

use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
};
use futures_util::{FutureExt, future::BoxFuture};
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};

use crate::{
    adapters::call_meta::FULL_ERROR,
    core::{
        desc::spawn_isolated,
        model::{
            AuthVerdict, CallMeta, PathParams, Request, RequestStack, RequestType, Response,
            SpanId,
        },
        server::{INTERNAL_PREFIX, Server},
    },
    error::{ApiError, ApiResult, ErrCode},
};

/// Raw auth material extracted from an inbound request. This is also the
/// wire format of the remote auth-handler endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
}

impl AuthPayload {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: header::HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Self {
            authorization: get(header::AUTHORIZATION),
            cookie: get(header::COOKIE),
        }
    }

    /// No auth material at all: the request is anonymous, the handler is
    /// never invoked.
    pub fn is_empty(&self) -> bool {
        self.authorization.is_none() && self.cookie.is_none()
    }
}

/// A successful authentication.
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub uid: String,
    pub user_data: Option<serde_json::Value>,
}

pub type AuthHandlerFn =
    Arc<dyn Fn(AuthPayload) -> BoxFuture<'static, ApiResult<AuthOutcome>> + Send + Sync>;

enum AuthHandler {
    Local {
        service: String,
        handler: AuthHandlerFn,
    },
    Remote {
        service: String,
    },
}

/// The app's single auth handler, local or forwarded.
pub struct Authenticator {
    handler: AuthHandler,
}

impl Authenticator {
    pub fn local(service: impl Into<String>, handler: AuthHandlerFn) -> Self {
        Self {
            handler: AuthHandler::Local {
                service: service.into(),
                handler,
            },
        }
    }

    pub fn remote(service: impl Into<String>) -> Self {
        Self {
            handler: AuthHandler::Remote {
                service: service.into(),
            },
        }
    }

    pub fn service(&self) -> &str {
        match &self.handler {
            AuthHandler::Local { service, .. } | AuthHandler::Remote { service } => service,
        }
    }

    /// Whether the handler runs inside this instance.
    pub fn is_local(&self) -> bool {
        matches!(self.handler, AuthHandler::Local { .. })
    }

    /// Run the handler against extracted auth material directly, bypassing
    /// the isolation wrapper. Used by the reserved auth endpoint.
    pub async fn run_local(&self, payload: AuthPayload) -> ApiResult<AuthOutcome> {
        match &self.handler {
            AuthHandler::Local { handler, .. } => handler(payload).await,
            AuthHandler::Remote { .. } => Err(ApiError::internal(
                "auth handler is not hosted in this instance",
            )),
        }
    }

    /// Authenticate one request.
    pub async fn authenticate(
        &self,
        server: &Arc<Server>,
        meta: &CallMeta,
        payload: AuthPayload,
    ) -> ApiResult<AuthOutcome> {
        match &self.handler {
            AuthHandler::Local { service, handler } => {
                let req = auth_request(service, meta);
                let tracer = server.tracer().clone();
                let handler = handler.clone();
                spawn_isolated(async move {
                    let stack = RequestStack::current().unwrap_or_default();
                    stack.push(req.clone());
                    tracer.begin_request(&req);

                    let result = std::panic::AssertUnwindSafe(handler(payload))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|p| Err(ApiError::from_panic(p.as_ref())));

                    let (status, error) = match &result {
                        Ok(_) => (StatusCode::OK, None),
                        Err(err) => (err.http_status(), Some(err.clone())),
                    };
                    tracer.finish_request(
                        &req,
                        &Response {
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
                .await
            }
            AuthHandler::Remote { service } => {
                self.authenticate_remote(server, meta, service, payload).await
            }
        }
    }

    async fn authenticate_remote(
        &self,
        server: &Arc<Server>,
        meta: &CallMeta,
        service: &str,
        payload: AuthPayload,
    ) -> ApiResult<AuthOutcome> {
        let base = server.config().service_url(service).ok_or_else(|| {
            ApiError::unavailable(format!("no address known for auth service {service}"))
        })?;
        let url = format!("{}{INTERNAL_PREFIX}/authhandler", base.trim_end_matches('/'));

        let body = serde_json::to_vec(&payload)
            .map_err(|e| ApiError::internal(format!("auth payload encoding failed: {e}")))?;
        let mut out = axum::http::Request::builder()
            .method(Method::POST)
            .uri(&url)
            .body(Body::from(body))
            .map_err(|e| ApiError::internal(format!("building auth request failed: {e}")))?;
        out.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        server
            .codec()
            .add_to_request(meta, SpanId::generate(), service, out.headers_mut())?;

        let resp = server
            .http_client()
            .send_request(out)
            .await
            .map_err(|e| ApiError::unavailable(format!("auth handler call failed: {e}")))?;

        let (parts, body) = resp.into_parts();
        let bytes = body
            .collect()
            .await
            .map_err(|e| ApiError::unavailable(format!("reading auth response failed: {e}")))?
            .to_bytes();

        if parts.status.is_success() {
            let verdict: AuthVerdict = serde_json::from_slice(&bytes)
                .map_err(|e| ApiError::internal(format!("decoding auth verdict failed: {e}")))?;
            Ok(AuthOutcome {
                uid: verdict.uid,
                user_data: verdict.user_data,
            })
        } else if parts.headers.contains_key(&FULL_ERROR) {
            Err(ApiError::from_internal_body(&bytes)
                .unwrap_or_else(|_| ApiError::from_http_status(parts.status)))
        } else {
            Err(ApiError::from_http_status(parts.status))
        }
    }
}

/// Resolve the authenticated identity for one inbound request.
///
/// Identity propagated by a verified internal caller is trusted as-is. A
/// boundary request with auth material runs the auth handler; an
/// Unauthenticated verdict is swallowed when the endpoint does not strictly
/// require auth, so the request proceeds anonymously.
pub async fn resolve(
    server: &Arc<Server>,
    meta: &CallMeta,
    headers: &HeaderMap,
    requires_auth: bool,
) -> ApiResult<Option<AuthOutcome>> {
    if let Some(internal) = &meta.internal {
        if let Some(uid) = &internal.auth_uid {
            return Ok(Some(AuthOutcome {
                uid: uid.clone(),
                user_data: internal.auth_data.clone(),
            }));
        }
    }

    let Some(authenticator) = server.authenticator() else {
        return if requires_auth {
            Err(ApiError::unauthenticated("endpoint requires auth"))
        } else {
            Ok(None)
        };
    };

    let payload = AuthPayload::from_headers(headers);
    if payload.is_empty() {
        return if requires_auth {
            Err(ApiError::unauthenticated("missing auth credentials"))
        } else {
            Ok(None)
        };
    }

    match authenticator.authenticate(server, meta, payload).await {
        Ok(outcome) => Ok(Some(outcome)),
        Err(err) if err.code == ErrCode::Unauthenticated && !requires_auth => Ok(None),
        Err(err) => Err(err),
    }
}

fn auth_request(service: &str, meta: &CallMeta) -> Arc<Request> {
    let span = tracing::info_span!(
        "auth_handler",
        service = %service,
        trace_id = %meta.trace_id,
    );
    Arc::new(Request {
        trace_id: meta.trace_id,
        span_id: SpanId::generate(),
        parent_span_id: meta.parent_span_id,
        typ: RequestType::AuthHandler,
        service: service.to_string(),
        endpoint: "AuthHandler".to_string(),
        started_at: SystemTime::now(),
        start: Instant::now(),
        traced: meta.traced,
        span,
        // Auth material is never attached to traces.
        payload: None,
        path_params: PathParams::default(),
        caller: None,
        auth_uid: None,
        auth_data: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer t"));
        let payload = AuthPayload::from_headers(&headers);
        assert_eq!(payload.authorization.as_deref(), Some("Bearer t"));
        assert!(payload.cookie.is_none());
        assert!(!payload.is_empty());

        let empty = AuthPayload::from_headers(&HeaderMap::new());
        assert!(empty.is_empty());
    }

    #[test]
    fn test_payload_wire_format() {
        let payload = AuthPayload {
            authorization: Some("Bearer t".into()),
            cookie: None,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json, serde_json::json!({"authorization": "Bearer t"}));
    }
}
