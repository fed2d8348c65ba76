//! Ordered middleware chain for the endpoint dispatcher.
//!
//! Middleware run as a cascading closure: each layer receives a [`Next`]
//! continuation; calling it beyond the last layer invokes the actual handler,
//! and calling it a second time from the same layer yields an Internal error.
//! Every layer independently catches panics, so a panic deep in the chain
//! still lets outer layers finish and contribute response headers.
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use axum::http::HeaderMap;
use futures_util::{FutureExt, future::BoxFuture};

use crate::{
    core::model::Request,
    error::{ApiError, ApiResult},
};

/// Input seen by middleware: the immutable request descriptor. The typed
/// payload stays behind the innermost handler closure.
#[derive(Clone)]
pub struct MwContext {
    pub req: Arc<Request>,
}

/// Outcome flowing back out through the chain. Layers may attach extra
/// response headers on the way out; those are applied to the client response
/// even on error paths.
pub struct MwResponse {
    pub result: ApiResult<serde_json::Value>,
    pub headers: HeaderMap,
}

impl MwResponse {
    pub fn ok(payload: serde_json::Value) -> Self {
        Self {
            result: Ok(payload),
            headers: HeaderMap::new(),
        }
    }

    pub fn err(err: ApiError) -> Self {
        Self {
            result: Err(err),
            headers: HeaderMap::new(),
        }
    }
}

/// A single middleware layer.
pub type Middleware =
    Arc<dyn Fn(MwContext, Next) -> BoxFuture<'static, MwResponse> + Send + Sync>;

/// The innermost handler invoked when the chain is exhausted.
pub type ChainHandler =
    Arc<dyn Fn(MwContext) -> BoxFuture<'static, MwResponse> + Send + Sync>;

/// Continuation handed to each middleware layer.
pub struct Next {
    chain: Arc<[Middleware]>,
    index: usize,
    handler: ChainHandler,
    used: Arc<AtomicBool>,
}

impl Next {
    /// Advance the chain. The second call from the same layer is an error.
    pub async fn run(&self, ctx: MwContext) -> MwResponse {
        if self.used.swap(true, Ordering::SeqCst) {
            return MwResponse::err(ApiError::internal(
                "middleware called next() too many times",
            ));
        }

        if self.index < self.chain.len() {
            let layer = self.chain[self.index].clone();
            let next = Next {
                chain: self.chain.clone(),
                index: self.index + 1,
                handler: self.handler.clone(),
                used: Arc::new(AtomicBool::new(false)),
            };
            run_isolated(layer(ctx, next)).await
        } else {
            run_isolated((self.handler)(ctx)).await
        }
    }
}

/// Execute one chain, running `handler` when all layers have passed through.
pub async fn run_chain(chain: Arc<[Middleware]>, handler: ChainHandler, ctx: MwContext) -> MwResponse {
    let next = Next {
        chain,
        index: 0,
        handler,
        used: Arc::new(AtomicBool::new(false)),
    };
    next.run(ctx).await
}

/// Catch a panic inside one layer and convert it to an Internal error so the
/// unwind never crosses into the enclosing layer.
async fn run_isolated(fut: BoxFuture<'_, MwResponse>) -> MwResponse {
    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(resp) => resp,
        Err(payload) => MwResponse::err(ApiError::from_panic(payload.as_ref())),
    }
}
