//! Transport-level encoding of call metadata.
//!
//! Serializes trace identity, sampling, caller identity and auth payload into
//! HTTP headers for service-to-service calls, and parses/verifies the same
//! headers on the inbound side. Trace context rides a W3C-style
//! `traceparent` plus a `tracestate` sidecar for cross-process event linkage.
//! Internal-call markers are only trusted once the configured service-auth
//! scheme has verified the request; platform-originated requests carry their
//! own HMAC signature checked within a fixed clock-skew window.
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{
    core::{
        caller::Caller,
        model::{CallMeta, InternalCallMeta, SpanId, TraceId},
    },
    error::ApiError,
};

type HmacSha256 = Hmac<Sha256>;

pub const TRACEPARENT: HeaderName = HeaderName::from_static("traceparent");
pub const TRACESTATE: HeaderName = HeaderName::from_static("tracestate");
pub const META_SVC_AUTH: HeaderName = HeaderName::from_static("x-encore-meta-svc-auth");
pub const META_SVC_AUTH_SIG: HeaderName = HeaderName::from_static("x-encore-meta-svc-auth-sig");
pub const META_DATE: HeaderName = HeaderName::from_static("x-encore-meta-date");
pub const META_CALLER: HeaderName = HeaderName::from_static("x-encore-meta-caller");
pub const META_CALLEE: HeaderName = HeaderName::from_static("x-encore-meta-callee");
pub const META_USER_ID: HeaderName = HeaderName::from_static("x-encore-meta-user-id");
pub const META_AUTH_DATA: HeaderName = HeaderName::from_static("x-encore-meta-auth-data");
pub const PLATFORM_AUTH: HeaderName = HeaderName::from_static("x-encore-auth");
pub const TRACE_ID_RESPONSE: HeaderName = HeaderName::from_static("x-encore-trace-id");
pub const FULL_ERROR: HeaderName = HeaderName::from_static("x-encore-full-error");
pub const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
pub const CORRELATION_ID: HeaderName = HeaderName::from_static("x-correlation-id");

/// Key in the tracestate list carrying the originating span and event id.
const TRACESTATE_KEY: &str = "encore";

/// Allowed clock skew when verifying platform signatures.
const PLATFORM_SKEW: chrono::Duration = chrono::Duration::minutes(15);

/// How service-to-service requests are authenticated.
#[derive(Debug, Clone)]
pub enum SvcAuth {
    /// No signing; internal markers are trusted as-is (local development).
    Noop,
    /// HMAC-SHA256 keyed by environment, key tagged with an id.
    Hmac { key_id: u32, key: Vec<u8> },
}

impl SvcAuth {
    fn method_name(&self) -> &'static str {
        match self {
            SvcAuth::Noop => "noop",
            SvcAuth::Hmac { .. } => "hmac",
        }
    }
}

/// A rotatable, id-tagged platform signing key.
#[derive(Debug, Clone)]
pub struct PlatformKey {
    pub id: u32,
    pub key: Vec<u8>,
}

/// Encodes and decodes [`CallMeta`] on HTTP headers.
pub struct MetaCodec {
    svc_auth: SvcAuth,
    platform_keys: Vec<PlatformKey>,
}

impl MetaCodec {
    pub fn new(svc_auth: SvcAuth, platform_keys: Vec<PlatformKey>) -> Self {
        Self {
            svc_auth,
            platform_keys,
        }
    }

    /// Extract call metadata from inbound headers.
    ///
    /// If no trace id is present a fresh one is generated and the request is
    /// a new trace root. Internal-call markers are only honored when the
    /// service-auth signature verifies; anything else is a boundary request.
    pub fn parse_inbound(&self, headers: &HeaderMap) -> Result<CallMeta, ApiError> {
        let mut meta = parse_traceparent(headers).unwrap_or_else(CallMeta::new_root);
        if let Some(event_id) = parse_tracestate(headers) {
            meta.parent_event_id = Some(event_id);
        }

        if self.verify_svc_auth(headers) {
            if let Some(caller_value) = headers.get(&META_CALLER) {
                let caller_str = caller_value
                    .to_str()
                    .map_err(|_| ApiError::invalid_argument("malformed caller metadata"))?;
                let caller: Caller = caller_str
                    .parse()
                    .map_err(|e| ApiError::invalid_argument(format!("bad caller metadata: {e}")))?;

                let auth_uid = headers
                    .get(&META_USER_ID)
                    .and_then(|v| v.to_str().ok())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string);
                let auth_data = match headers.get(&META_AUTH_DATA) {
                    Some(v) => {
                        let raw = BASE64
                            .decode(v.as_bytes())
                            .map_err(|_| ApiError::invalid_argument("malformed auth data"))?;
                        Some(serde_json::from_slice(&raw).map_err(|_| {
                            ApiError::invalid_argument("malformed auth data payload")
                        })?)
                    }
                    None => None,
                };

                meta.internal = Some(InternalCallMeta {
                    caller,
                    auth_uid,
                    auth_data,
                });
            }
        }

        Ok(meta)
    }

    /// Inverse of [`MetaCodec::parse_inbound`]: serialize metadata onto an
    /// outbound request targeting `callee` and sign it.
    pub fn add_to_request(
        &self,
        meta: &CallMeta,
        this_span: SpanId,
        callee: &str,
        headers: &mut HeaderMap,
    ) -> Result<(), ApiError> {
        let traceparent = format_traceparent(meta.trace_id, this_span, meta.traced);
        headers.insert(TRACEPARENT, header_value(&traceparent)?);
        if let Some(event_id) = meta.parent_event_id {
            let state = format!("{TRACESTATE_KEY}={this_span}:{event_id}");
            headers.insert(TRACESTATE, header_value(&state)?);
        }
        headers.insert(META_CALLEE, header_value(callee)?);

        if let Some(internal) = &meta.internal {
            headers.insert(META_CALLER, header_value(&internal.caller.caller_string())?);
            if let Some(uid) = &internal.auth_uid {
                headers.insert(META_USER_ID, header_value(uid)?);
            }
            if let Some(data) = &internal.auth_data {
                let raw = serde_json::to_vec(data)
                    .map_err(|e| ApiError::internal(format!("auth data encoding failed: {e}")))?;
                headers.insert(META_AUTH_DATA, header_value(&BASE64.encode(raw))?);
            }
        }

        self.sign_svc_auth(headers)?;
        Ok(())
    }

    fn svc_auth_payload(headers: &HeaderMap) -> Vec<u8> {
        let date = headers
            .get(&META_DATE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let caller = headers
            .get(&META_CALLER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let mut payload = Vec::with_capacity(date.len() + caller.len() + 1);
        payload.extend_from_slice(date.as_bytes());
        payload.push(0);
        payload.extend_from_slice(caller.as_bytes());
        payload
    }

    fn sign_svc_auth(&self, headers: &mut HeaderMap) -> Result<(), ApiError> {
        headers.insert(META_SVC_AUTH, header_value(self.svc_auth.method_name())?);
        if let SvcAuth::Hmac { key_id, key } = &self.svc_auth {
            headers.insert(META_DATE, header_value(&Utc::now().to_rfc3339())?);
            let payload = Self::svc_auth_payload(headers);
            let mut mac = HmacSha256::new_from_slice(key)
                .map_err(|_| ApiError::internal("invalid service auth key"))?;
            mac.update(&payload);
            let sig = BASE64.encode(mac.finalize().into_bytes());
            headers.insert(META_SVC_AUTH_SIG, header_value(&format!("{key_id}:{sig}"))?);
        }
        Ok(())
    }

    /// Whether the inbound request carries a valid service-auth signature.
    /// An unrecognized or missing signature means "boundary request", never
    /// an error.
    pub fn verify_svc_auth(&self, headers: &HeaderMap) -> bool {
        let method = headers
            .get(&META_SVC_AUTH)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        match &self.svc_auth {
            SvcAuth::Noop => method == "noop",
            SvcAuth::Hmac { key_id, key } => {
                if method != "hmac" {
                    return false;
                }
                let Some(sig) = headers.get(&META_SVC_AUTH_SIG).and_then(|v| v.to_str().ok())
                else {
                    return false;
                };
                let Some((sig_key_id, sig_b64)) = sig.split_once(':') else {
                    return false;
                };
                if sig_key_id.parse::<u32>().ok() != Some(*key_id) {
                    return false;
                }
                let Ok(sig_bytes) = BASE64.decode(sig_b64) else {
                    return false;
                };
                let payload = Self::svc_auth_payload(headers);
                let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
                    return false;
                };
                mac.update(&payload);
                mac.verify_slice(&sig_bytes).is_ok()
            }
        }
    }

    /// Verify (and consume) the platform signature header.
    ///
    /// The signature is HMAC-SHA256 over `date NUL path`, keyed by one of the
    /// rotatable id-tagged platform keys, accepted within a 15-minute skew
    /// window. The header is stripped once consumed, regardless of outcome.
    pub fn verify_platform(&self, headers: &mut HeaderMap, path: &str, now: DateTime<Utc>) -> bool {
        let Some(auth) = headers.remove(&PLATFORM_AUTH) else {
            return false;
        };
        let Ok(auth) = auth.to_str() else {
            return false;
        };
        let Some((key_id, sig_b64)) = auth.split_once(':') else {
            return false;
        };
        let Ok(key_id) = key_id.parse::<u32>() else {
            return false;
        };
        let Some(key) = self.platform_keys.iter().find(|k| k.id == key_id) else {
            return false;
        };
        let Some(date) = headers.get(axum::http::header::DATE).and_then(|v| v.to_str().ok())
        else {
            return false;
        };
        let Ok(parsed_date) = DateTime::parse_from_rfc2822(date) else {
            return false;
        };
        let skew = now.signed_duration_since(parsed_date.with_timezone(&Utc));
        if skew > PLATFORM_SKEW || skew < -PLATFORM_SKEW {
            return false;
        }
        let Ok(sig_bytes) = BASE64.decode(sig_b64) else {
            return false;
        };
        let mut payload = Vec::with_capacity(date.len() + path.len() + 1);
        payload.extend_from_slice(date.as_bytes());
        payload.push(0);
        payload.extend_from_slice(path.as_bytes());

        let Ok(mut mac) = HmacSha256::new_from_slice(&key.key) else {
            return false;
        };
        mac.update(&payload);
        mac.verify_slice(&sig_bytes).is_ok()
    }

    /// Sign an outbound request the way the platform does. Test/tooling aid.
    pub fn platform_signature(key: &PlatformKey, date: &str, path: &str) -> String {
        let mut payload = Vec::with_capacity(date.len() + path.len() + 1);
        payload.extend_from_slice(date.as_bytes());
        payload.push(0);
        payload.extend_from_slice(path.as_bytes());
        let mut mac = HmacSha256::new_from_slice(&key.key).expect("hmac accepts any key length");
        mac.update(&payload);
        format!("{}:{}", key.id, BASE64.encode(mac.finalize().into_bytes()))
    }
}

fn header_value(s: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(s)
        .map_err(|_| ApiError::internal(format!("invalid header value: {s:?}")))
}

fn format_traceparent(trace_id: TraceId, span_id: SpanId, sampled: bool) -> String {
    let flags = if sampled { "01" } else { "00" };
    format!("00-{trace_id}-{span_id}-{flags}")
}

fn parse_traceparent(headers: &HeaderMap) -> Option<CallMeta> {
    let value = headers.get(&TRACEPARENT)?.to_str().ok()?;
    let mut parts = value.split('-');
    let _version = parts.next()?;
    let trace_id = TraceId::parse_hex(parts.next()?)?;
    if trace_id.is_zero() {
        return None;
    }
    let parent_span_id = SpanId::parse_hex(parts.next()?)?;
    let flags = parts.next()?;
    let traced = flags
        .bytes()
        .last()
        .map(|b| b & 1 == 1)
        .unwrap_or(false);
    Some(CallMeta {
        trace_id,
        parent_span_id: Some(parent_span_id),
        parent_event_id: None,
        traced,
        internal: None,
    })
}

/// Extract the originating event id from our tracestate entry, if present.
fn parse_tracestate(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(&TRACESTATE)?.to_str().ok()?;
    for entry in value.split(',') {
        let entry = entry.trim();
        if let Some(rest) = entry.strip_prefix(TRACESTATE_KEY) {
            let rest = rest.strip_prefix('=')?;
            let (_span, event) = rest.split_once(':')?;
            return event.parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use axum::http::header::DATE;

    use super::*;

    fn hmac_codec() -> MetaCodec {
        MetaCodec::new(
            SvcAuth::Hmac {
                key_id: 7,
                key: b"super-secret".to_vec(),
            },
            vec![PlatformKey {
                id: 1,
                key: b"platform-key".to_vec(),
            }],
        )
    }

    fn internal_meta() -> CallMeta {
        CallMeta {
            trace_id: TraceId::generate(),
            parent_span_id: None,
            parent_event_id: Some(42),
            traced: true,
            internal: Some(InternalCallMeta {
                caller: Caller::Api {
                    service: "users".into(),
                    endpoint: "Get".into(),
                },
                auth_uid: Some("u123".into()),
                auth_data: Some(serde_json::json!({"role": "admin"})),
            }),
        }
    }

    #[test]
    fn test_round_trip_internal_call() {
        let codec = hmac_codec();
        let meta = internal_meta();
        let span = SpanId::generate();

        let mut headers = HeaderMap::new();
        codec
            .add_to_request(&meta, span, "billing", &mut headers)
            .unwrap();

        let parsed = codec.parse_inbound(&headers).unwrap();
        assert_eq!(parsed.trace_id, meta.trace_id);
        assert_eq!(parsed.parent_span_id, Some(span));
        assert_eq!(parsed.parent_event_id, Some(42));
        assert!(parsed.traced);

        let internal = parsed.internal.expect("internal meta verified");
        assert_eq!(
            internal.caller,
            Caller::Api {
                service: "users".into(),
                endpoint: "Get".into()
            }
        );
        assert_eq!(internal.auth_uid.as_deref(), Some("u123"));
        assert_eq!(
            internal.auth_data,
            Some(serde_json::json!({"role": "admin"}))
        );
    }

    #[test]
    fn test_tampered_signature_downgrades_to_boundary() {
        let codec = hmac_codec();
        let mut headers = HeaderMap::new();
        codec
            .add_to_request(&internal_meta(), SpanId::generate(), "billing", &mut headers)
            .unwrap();
        headers.insert(META_CALLER, HeaderValue::from_static("api:evil.Steal"));

        let parsed = codec.parse_inbound(&headers).unwrap();
        assert!(parsed.internal.is_none(), "tampered meta must not verify");
    }

    #[test]
    fn test_missing_trace_context_creates_root() {
        let codec = hmac_codec();
        let parsed = codec.parse_inbound(&HeaderMap::new()).unwrap();
        assert!(!parsed.trace_id.is_zero());
        assert!(parsed.parent_span_id.is_none());
        assert!(parsed.internal.is_none());
    }

    #[test]
    fn test_traceparent_without_internal_headers_is_boundary() {
        let codec = hmac_codec();
        let mut headers = HeaderMap::new();
        headers.insert(
            TRACEPARENT,
            HeaderValue::from_static("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"),
        );
        let parsed = codec.parse_inbound(&headers).unwrap();
        assert_eq!(
            parsed.trace_id.to_string(),
            "0af7651916cd43dd8448eb211c80319c"
        );
        assert!(parsed.traced);
        assert!(parsed.internal.is_none());
    }

    #[test]
    fn test_platform_signature_verifies_and_is_stripped() {
        let codec = hmac_codec();
        let key = PlatformKey {
            id: 1,
            key: b"platform-key".to_vec(),
        };
        let now = Utc::now();
        let date = now.to_rfc2822();
        let sig = MetaCodec::platform_signature(&key, &date, "/users/42");

        let mut headers = HeaderMap::new();
        headers.insert(DATE, HeaderValue::from_str(&date).unwrap());
        headers.insert(PLATFORM_AUTH, HeaderValue::from_str(&sig).unwrap());

        assert!(codec.verify_platform(&mut headers, "/users/42", now));
        assert!(headers.get(&PLATFORM_AUTH).is_none(), "header consumed");
    }

    #[test]
    fn test_platform_signature_rejects_stale_date() {
        let codec = hmac_codec();
        let key = PlatformKey {
            id: 1,
            key: b"platform-key".to_vec(),
        };
        let stale = Utc::now() - chrono::Duration::minutes(20);
        let date = stale.to_rfc2822();
        let sig = MetaCodec::platform_signature(&key, &date, "/x");

        let mut headers = HeaderMap::new();
        headers.insert(DATE, HeaderValue::from_str(&date).unwrap());
        headers.insert(PLATFORM_AUTH, HeaderValue::from_str(&sig).unwrap());

        assert!(!codec.verify_platform(&mut headers, "/x", Utc::now()));
    }

    #[test]
    fn test_platform_signature_rejects_wrong_path() {
        let codec = hmac_codec();
        let key = PlatformKey {
            id: 1,
            key: b"platform-key".to_vec(),
        };
        let now = Utc::now();
        let date = now.to_rfc2822();
        let sig = MetaCodec::platform_signature(&key, &date, "/a");

        let mut headers = HeaderMap::new();
        headers.insert(DATE, HeaderValue::from_str(&date).unwrap());
        headers.insert(PLATFORM_AUTH, HeaderValue::from_str(&sig).unwrap());

        assert!(!codec.verify_platform(&mut headers, "/b", now));
    }

    #[test]
    fn test_noop_auth_trusts_marker() {
        let codec = MetaCodec::new(SvcAuth::Noop, Vec::new());
        let mut headers = HeaderMap::new();
        codec
            .add_to_request(&internal_meta(), SpanId::generate(), "billing", &mut headers)
            .unwrap();
        let parsed = codec.parse_inbound(&headers).unwrap();
        assert!(parsed.internal.is_some());
    }
}
