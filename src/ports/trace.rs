//! Request-tracking port.
//!
//! The dispatcher reports the lifecycle of every request through this
//! interface: `begin_request` before any handler code can observe the request
//! as current, `finish_request` as the very last operation. The pairing
//! invariant (every begun request finished exactly once, none finished
//! without beginning) is enforced by the dispatcher; sinks may rely on it.
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use crate::core::model::{Request, Response};

/// Pluggable trace-event sink.
pub trait Tracer: Send + Sync + 'static {
    fn begin_request(&self, req: &Arc<Request>);
    fn finish_request(&self, req: &Arc<Request>, resp: &Response);
}

/// Sink that drops all events. Used when tracing is disabled.
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn begin_request(&self, _req: &Arc<Request>) {}
    fn finish_request(&self, _req: &Arc<Request>, _resp: &Response) {}
}

/// Sink that emits structured log events through `tracing`.
pub struct LogTracer;

impl Tracer for LogTracer {
    fn begin_request(&self, req: &Arc<Request>) {
        tracing::debug!(
            trace_id = %req.trace_id,
            span_id = %req.span_id,
            service = %req.service,
            endpoint = %req.endpoint,
            "request started"
        );
    }

    fn finish_request(&self, req: &Arc<Request>, resp: &Response) {
        tracing::debug!(
            trace_id = %req.trace_id,
            span_id = %req.span_id,
            service = %req.service,
            endpoint = %req.endpoint,
            status = resp.status.as_u16(),
            duration_ms = resp.duration.as_millis() as u64,
            error = resp.error.as_ref().map(|e| e.code.as_str()),
            "request finished"
        );
    }
}

/// Counts begin/finish pairs. Test aid for the pairing invariant.
#[derive(Default)]
pub struct CountingTracer {
    pub begun: AtomicU64,
    pub finished: AtomicU64,
}

impl CountingTracer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn counts(&self) -> (u64, u64) {
        (
            self.begun.load(Ordering::SeqCst),
            self.finished.load(Ordering::SeqCst),
        )
    }
}

impl Tracer for CountingTracer {
    fn begin_request(&self, _req: &Arc<Request>) {
        self.begun.fetch_add(1, Ordering::SeqCst);
    }

    fn finish_request(&self, _req: &Arc<Request>, _resp: &Response) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}
