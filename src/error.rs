//! Structured API error type shared by the dispatcher, the router and the
//! service-to-service call path.
//!
//! Errors carry a machine-readable [`ErrCode`], a human message and an
//! optional metadata map. Two encodings exist:
//! * **internal**: full-fidelity JSON that round-trips through a peer
//!   service call intact (marked on the wire with `X-Encore-Full-Error: 1`)
//! * **external**: sanitized, HTTP-status-mapped body for boundary clients
use std::{collections::BTreeMap, fmt};

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

/// Closed set of machine-readable error codes, mirroring the gRPC code space
/// so that errors survive a service-to-service round trip without loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrCode {
    Ok,
    Canceled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl ErrCode {
    /// Map a code onto the HTTP status used when writing the response.
    pub fn http_status(self) -> StatusCode {
        match self {
            ErrCode::Ok => StatusCode::OK,
            ErrCode::Canceled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            ErrCode::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
            ErrCode::InvalidArgument => StatusCode::BAD_REQUEST,
            ErrCode::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            ErrCode::NotFound => StatusCode::NOT_FOUND,
            ErrCode::AlreadyExists => StatusCode::CONFLICT,
            ErrCode::PermissionDenied => StatusCode::FORBIDDEN,
            ErrCode::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
            ErrCode::FailedPrecondition => StatusCode::BAD_REQUEST,
            ErrCode::Aborted => StatusCode::CONFLICT,
            ErrCode::OutOfRange => StatusCode::BAD_REQUEST,
            ErrCode::Unimplemented => StatusCode::NOT_IMPLEMENTED,
            ErrCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ErrCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrCode::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
            ErrCode::Unauthenticated => StatusCode::UNAUTHORIZED,
        }
    }

    /// Inverse of [`ErrCode::http_status`], used when a peer response carries
    /// no full-fidelity error body and only the status line is available.
    pub fn from_http_status(status: StatusCode) -> Self {
        match status {
            StatusCode::BAD_REQUEST => ErrCode::InvalidArgument,
            StatusCode::UNAUTHORIZED => ErrCode::Unauthenticated,
            StatusCode::FORBIDDEN => ErrCode::PermissionDenied,
            StatusCode::NOT_FOUND => ErrCode::NotFound,
            StatusCode::CONFLICT => ErrCode::AlreadyExists,
            StatusCode::TOO_MANY_REQUESTS => ErrCode::ResourceExhausted,
            StatusCode::NOT_IMPLEMENTED => ErrCode::Unimplemented,
            StatusCode::SERVICE_UNAVAILABLE => ErrCode::Unavailable,
            StatusCode::GATEWAY_TIMEOUT => ErrCode::DeadlineExceeded,
            s if s.is_success() => ErrCode::Ok,
            _ => ErrCode::Unknown,
        }
    }

    /// Canonical string form (also the serde encoding).
    pub fn as_str(self) -> &'static str {
        match self {
            ErrCode::Ok => "ok",
            ErrCode::Canceled => "canceled",
            ErrCode::Unknown => "unknown",
            ErrCode::InvalidArgument => "invalid_argument",
            ErrCode::DeadlineExceeded => "deadline_exceeded",
            ErrCode::NotFound => "not_found",
            ErrCode::AlreadyExists => "already_exists",
            ErrCode::PermissionDenied => "permission_denied",
            ErrCode::ResourceExhausted => "resource_exhausted",
            ErrCode::FailedPrecondition => "failed_precondition",
            ErrCode::Aborted => "aborted",
            ErrCode::OutOfRange => "out_of_range",
            ErrCode::Unimplemented => "unimplemented",
            ErrCode::Internal => "internal",
            ErrCode::Unavailable => "unavailable",
            ErrCode::DataLoss => "data_loss",
            ErrCode::Unauthenticated => "unauthenticated",
        }
    }
}

impl fmt::Display for ErrCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured application error.
///
/// The `meta` map is ordered (BTreeMap) so the serialized form is stable,
/// which keeps the internal encoding byte-for-byte reproducible in tests.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: ErrCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<BTreeMap<String, serde_json::Value>>,
    /// Captured panic/stack information for Internal errors. Only ever
    /// exposed through the internal encoding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ApiError {
    pub fn new(code: ErrCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            stack: None,
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrCode::InvalidArgument, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(ErrCode::Unauthenticated, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrCode::PermissionDenied, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrCode::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrCode::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrCode::Unavailable, message)
    }

    /// Build an Internal error from a recovered panic payload.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "handler panicked".to_string()
        };
        let mut err = Self::new(ErrCode::Internal, "internal error");
        err.stack = Some(msg);
        err
    }

    /// Attach a metadata entry, preserving any existing map.
    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value);
        self
    }

    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    /// Full-fidelity JSON encoding for internal (service-to-service) callers.
    /// Decoding this body with [`ApiError::from_internal_body`] must yield an
    /// equal value.
    pub fn to_internal_body(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|_| br#"{"code":"internal","message":"error encoding failed"}"#.to_vec())
    }

    pub fn from_internal_body(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    /// Sanitized JSON encoding for external (boundary) callers. Codes that
    /// indicate an internal fault never leak their message or metadata.
    pub fn to_external_body(&self) -> Vec<u8> {
        let (code, message) = match self.code {
            ErrCode::Internal | ErrCode::Unknown | ErrCode::DataLoss => {
                (self.code, "internal error".to_string())
            }
            _ => (self.code, self.message.clone()),
        };
        let body = serde_json::json!({
            "code": code,
            "message": message,
        });
        serde_json::to_vec(&body).unwrap_or_default()
    }

    /// Construct a generic error from a bare status line, used when a peer
    /// response carries no decodable error body.
    pub fn from_http_status(status: StatusCode) -> Self {
        let code = ErrCode::from_http_status(status);
        let message = status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string();
        Self::new(code, message)
    }
}

/// Result alias used throughout the dispatch pipeline.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrCode::InvalidArgument.http_status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrCode::Unauthenticated.http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrCode::PermissionDenied.http_status(), StatusCode::FORBIDDEN);
        assert_eq!(ErrCode::NotFound.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrCode::Unavailable.http_status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_status_mapping_inverse() {
        for code in [
            ErrCode::InvalidArgument,
            ErrCode::Unauthenticated,
            ErrCode::PermissionDenied,
            ErrCode::NotFound,
            ErrCode::ResourceExhausted,
            ErrCode::Unimplemented,
            ErrCode::Unavailable,
            ErrCode::DeadlineExceeded,
        ] {
            assert_eq!(ErrCode::from_http_status(code.http_status()), code);
        }
    }

    #[test]
    fn test_internal_encoding_round_trips() {
        let err = ApiError::permission_denied("wrong callee")
            .with_detail("expected", serde_json::json!("billing.Charge"))
            .with_detail("got", serde_json::json!("users.Get"));

        let body = err.to_internal_body();
        let decoded = ApiError::from_internal_body(&body).unwrap();
        assert_eq!(decoded, err);
    }

    #[test]
    fn test_external_encoding_sanitizes_internal_faults() {
        let mut err = ApiError::internal("database password was hunter2");
        err.stack = Some("stack trace".into());

        let body: serde_json::Value =
            serde_json::from_slice(&err.to_external_body()).unwrap();
        assert_eq!(body["code"], "internal");
        assert_eq!(body["message"], "internal error");
        assert!(body.get("stack").is_none());
        assert!(body.get("details").is_none());
    }

    #[test]
    fn test_panic_payload_capture() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom".to_string());
        let err = ApiError::from_panic(payload.as_ref());
        assert_eq!(err.code, ErrCode::Internal);
        assert_eq!(err.stack.as_deref(), Some("boom"));
    }
}
