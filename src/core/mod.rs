pub mod auth;
pub mod caller;
pub mod desc;
pub mod middleware;
pub mod model;
pub mod registry;
pub mod router;
pub mod server;

pub use auth::{AuthOutcome, AuthPayload, Authenticator};
pub use caller::Caller;
pub use desc::{Access, ApiEndpoint, EndpointDesc, EndpointEntry, RawEndpoint};
pub use middleware::{Middleware, MwContext, MwResponse, Next};
pub use model::{CallMeta, Request, Response, SpanId, TraceId, current_request};
pub use registry::Registry;
pub use server::{INTERNAL_PREFIX, Server, ServerBuilder};
