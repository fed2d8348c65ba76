//! Bounded request/response body capture for trace attachment.
//!
//! Mirrors body bytes into a pooled buffer up to a fixed cap (10 KiB for
//! requests, 100 KiB for responses). Whether to capture at all is decided
//! from the content type: a fixed allow-list always captures, an unknown or
//! missing type enters a peeking state that sniffs the first 512 bytes, and
//! every other explicit type never captures. Upgrade requests never capture.
//! The bound keeps traces small without a second pass over the body.
use std::{
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use axum::http::{HeaderMap, header};
use bytes::Bytes;
use once_cell::sync::Lazy;

use crate::core::model::CapturedBody;

/// Cap on captured request bytes.
pub const REQUEST_CAPTURE_CAP: usize = 10 * 1024;
/// Cap on captured response bytes.
pub const RESPONSE_CAPTURE_CAP: usize = 100 * 1024;

/// Bytes accumulated before a sniffing decision is committed.
const SNIFF_LEN: usize = 512;

// Shared buffer pool. Buffers are returned cleared but with their capacity
// retained, bounded so a burst of large captures doesn't pin memory forever.
static BUF_POOL: Lazy<Mutex<Vec<Vec<u8>>>> = Lazy::new(|| Mutex::new(Vec::new()));
const POOL_MAX: usize = 64;

fn pool_get() -> Vec<u8> {
    BUF_POOL
        .lock()
        .ok()
        .and_then(|mut pool| pool.pop())
        .unwrap_or_default()
}

fn pool_put(mut buf: Vec<u8>) {
    buf.clear();
    if let Ok(mut pool) = BUF_POOL.lock() {
        if pool.len() < POOL_MAX {
            pool.push(buf);
        }
    }
}

/// Content types that always capture. Matched against the media type with
/// parameters stripped, plus structured-syntax suffixes (`+json`, `+xml`).
fn content_type_captures(media_type: &str) -> bool {
    matches!(
        media_type,
        "application/json"
            | "text/plain"
            | "application/x-www-form-urlencoded"
            | "text/csv"
            | "application/javascript"
            | "text/javascript"
            | "application/ld+json"
            | "application/xml"
            | "text/xml"
            | "application/graphql"
    ) || media_type.ends_with("+json")
        || media_type.ends_with("+xml")
}

enum CaptureState {
    /// Decided not to capture.
    Off,
    /// Unknown content type: accumulate until enough bytes to sniff.
    Peeking { buf: Option<Vec<u8>>, cap: usize },
    Capturing {
        buf: Option<Vec<u8>>,
        cap: usize,
        overflowed: bool,
    },
    /// Buffer disposed; the committed decision is retained.
    Finished(Option<CapturedBody>),
}

/// Mirrors bytes flowing through a request or response body.
///
/// All state transitions are guarded by one mutex; the pooled buffer must
/// never be touched after [`BodyCapture::finish`] has disposed it.
pub struct BodyCapture {
    state: Mutex<CaptureState>,
}

impl BodyCapture {
    /// Build a capturer for an inbound request body.
    pub fn for_request(headers: &HeaderMap) -> Arc<Self> {
        Self::begin(headers, REQUEST_CAPTURE_CAP)
    }

    /// Build a capturer for an outbound response body.
    pub fn for_response(headers: &HeaderMap) -> Arc<Self> {
        Self::begin(headers, RESPONSE_CAPTURE_CAP)
    }

    fn begin(headers: &HeaderMap, cap: usize) -> Arc<Self> {
        let state = if headers.contains_key(header::UPGRADE) {
            CaptureState::Off
        } else {
            match media_type(headers) {
                Some(mt) if content_type_captures(&mt) => CaptureState::Capturing {
                    buf: Some(pool_get()),
                    cap,
                    overflowed: false,
                },
                Some(_) => CaptureState::Off,
                None => CaptureState::Peeking {
                    buf: Some(pool_get()),
                    cap,
                },
            }
        };
        Arc::new(Self {
            state: Mutex::new(state),
        })
    }

    /// Mirror a chunk of body bytes. Bytes beyond the cap are dropped, not
    /// the capture itself.
    pub fn write(&self, chunk: &[u8]) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        match &mut *state {
            CaptureState::Off | CaptureState::Finished(_) => {}
            CaptureState::Peeking { buf, cap } => {
                let cap = *cap;
                if let Some(mut b) = buf.take() {
                    let dropped = !append_capped(&mut b, chunk, cap);
                    if b.len() >= SNIFF_LEN || dropped {
                        // Enough accumulated: commit the sniffing decision.
                        let mut next = commit_peek(Some(b), cap);
                        if dropped {
                            if let CaptureState::Capturing { overflowed, .. } = &mut next {
                                *overflowed = true;
                            }
                        }
                        *state = next;
                    } else {
                        *buf = Some(b);
                    }
                }
            }
            CaptureState::Capturing {
                buf,
                cap,
                overflowed,
            } => {
                if let Some(b) = buf.as_mut() {
                    if !append_capped(b, chunk, *cap) {
                        *overflowed = true;
                    }
                }
            }
        }
    }

    /// Whether bytes are currently being mirrored (or still being peeked).
    pub fn is_active(&self) -> bool {
        match self.state.lock() {
            Ok(state) => matches!(
                &*state,
                CaptureState::Peeking { .. } | CaptureState::Capturing { .. }
            ),
            Err(_) => false,
        }
    }

    /// Commit the capture decision, dispose the pooled buffer and return the
    /// captured bytes, if any. Idempotent: later calls return the same
    /// committed decision without touching the disposed buffer.
    pub fn finish(&self) -> Option<CapturedBody> {
        let Ok(mut state) = self.state.lock() else {
            return None;
        };
        let result = match &mut *state {
            CaptureState::Off => None,
            CaptureState::Finished(result) => return result.clone(),
            CaptureState::Peeking { buf, cap } => {
                let cap = *cap;
                match buf.take() {
                    Some(b) => match commit_peek(Some(b), cap) {
                        CaptureState::Capturing {
                            buf, overflowed, ..
                        } => buf.map(|b| seal(b, overflowed)),
                        _ => None,
                    },
                    None => None,
                }
            }
            CaptureState::Capturing {
                buf, overflowed, ..
            } => {
                let overflowed = *overflowed;
                buf.take().map(|b| seal(b, overflowed))
            }
        };
        *state = CaptureState::Finished(result.clone());
        result
    }
}

/// Append up to `cap - buf.len()` bytes; returns false when any byte was
/// dropped.
fn append_capped(buf: &mut Vec<u8>, chunk: &[u8], cap: usize) -> bool {
    let room = cap.saturating_sub(buf.len());
    if chunk.len() <= room {
        buf.extend_from_slice(chunk);
        true
    } else {
        buf.extend_from_slice(&chunk[..room]);
        false
    }
}

/// Copy captured bytes out and return the buffer to the pool.
fn seal(buf: Vec<u8>, overflowed: bool) -> CapturedBody {
    let data = Bytes::copy_from_slice(&buf);
    pool_put(buf);
    CapturedBody { data, overflowed }
}

/// Decide a pending peek: textual content keeps capturing, binary drops.
fn commit_peek(buf: Option<Vec<u8>>, cap: usize) -> CaptureState {
    match buf {
        Some(mut b) => {
            let sniff = &b[..b.len().min(SNIFF_LEN)];
            if looks_textual(sniff) {
                let overflowed = b.len() > cap;
                b.truncate(cap);
                CaptureState::Capturing {
                    buf: Some(b),
                    cap,
                    overflowed,
                }
            } else {
                pool_put(b);
                CaptureState::Off
            }
        }
        None => CaptureState::Off,
    }
}

/// Minimal content sniff over the first bytes: anything with control bytes
/// outside tab/newline/carriage-return is treated as binary. No crate in our
/// stack covers MIME sniffing, and the trace attachment only needs a
/// text-vs-binary verdict.
fn looks_textual(data: &[u8]) -> bool {
    data.iter()
        .all(|&b| b >= 0x20 || b == b'\t' || b == b'\n' || b == b'\r')
}

fn media_type(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
    let mt = value.split(';').next().unwrap_or("").trim();
    if mt.is_empty() {
        return None;
    }
    Some(mt.to_ascii_lowercase())
}

/// Body wrapper that mirrors data frames into a [`BodyCapture`].
pub struct CapturedStream {
    inner: axum::body::Body,
    capture: Arc<BodyCapture>,
}

impl CapturedStream {
    pub fn wrap(inner: axum::body::Body, capture: Arc<BodyCapture>) -> axum::body::Body {
        axum::body::Body::new(Self { inner, capture })
    }
}

impl http_body::Body for CapturedStream {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        let poll = Pin::new(&mut self.inner).poll_frame(cx);
        if let Poll::Ready(Some(Ok(frame))) = &poll {
            if let Some(data) = frame.data_ref() {
                self.capture.write(data);
            }
        }
        poll
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(content_type: Option<&str>) -> HeaderMap {
        let mut h = HeaderMap::new();
        if let Some(ct) = content_type {
            h.insert(header::CONTENT_TYPE, HeaderValue::from_str(ct).unwrap());
        }
        h
    }

    #[test]
    fn test_allow_listed_type_captures() {
        let cap = BodyCapture::for_request(&headers(Some("application/json; charset=utf-8")));
        cap.write(br#"{"a":1}"#);
        let captured = cap.finish().unwrap();
        assert_eq!(&captured.data[..], br#"{"a":1}"#);
        assert!(!captured.overflowed);
    }

    #[test]
    fn test_unlisted_type_never_captures() {
        let cap = BodyCapture::for_request(&headers(Some("application/octet-stream")));
        cap.write(b"binary");
        assert!(cap.finish().is_none());
    }

    #[test]
    fn test_upgrade_request_never_captures() {
        let mut h = headers(Some("application/json"));
        h.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        let cap = BodyCapture::for_request(&h);
        cap.write(b"data");
        assert!(cap.finish().is_none());
    }

    #[test]
    fn test_request_overflow_truncates_at_cap() {
        let cap = BodyCapture::for_request(&headers(Some("text/plain")));
        cap.write(&vec![b'x'; REQUEST_CAPTURE_CAP + 100]);
        let captured = cap.finish().unwrap();
        assert!(captured.overflowed);
        assert_eq!(captured.data.len(), REQUEST_CAPTURE_CAP);
    }

    #[test]
    fn test_response_cap_is_larger() {
        let cap = BodyCapture::for_response(&headers(Some("application/json")));
        cap.write(&vec![b'y'; RESPONSE_CAPTURE_CAP]);
        cap.write(b"extra");
        let captured = cap.finish().unwrap();
        assert!(captured.overflowed);
        assert_eq!(captured.data.len(), RESPONSE_CAPTURE_CAP);
    }

    #[test]
    fn test_peek_commits_to_capture_for_text() {
        let cap = BodyCapture::for_request(&headers(None));
        // More than 512 bytes of text forces the sniff decision mid-stream.
        let chunk = vec![b'a'; 600];
        cap.write(&chunk);
        cap.write(b"tail");
        let captured = cap.finish().unwrap();
        assert_eq!(captured.data.len(), 604);
    }

    #[test]
    fn test_peek_drops_binary() {
        let cap = BodyCapture::for_request(&headers(None));
        let mut chunk = vec![0u8; 600];
        chunk[0] = b'P';
        cap.write(&chunk);
        assert!(cap.finish().is_none());
    }

    #[test]
    fn test_short_unknown_body_sniffed_at_finish() {
        let cap = BodyCapture::for_request(&headers(None));
        cap.write(b"short text body");
        let captured = cap.finish().unwrap();
        assert_eq!(&captured.data[..], b"short text body");
    }

    #[test]
    fn test_finish_is_idempotent_after_dispose() {
        let cap = BodyCapture::for_request(&headers(Some("application/json")));
        cap.write(b"{}");
        let first = cap.finish();
        let second = cap.finish();
        assert_eq!(first, second);
        // Writes after dispose are ignored.
        cap.write(b"late");
        assert_eq!(cap.finish(), first);
    }

    #[test]
    fn test_json_suffix_types_capture() {
        let cap = BodyCapture::for_request(&headers(Some("application/problem+json")));
        cap.write(b"{}");
        assert!(cap.finish().is_some());
    }
}
