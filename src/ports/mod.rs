//! Ports (interfaces) separating the serving core from I/O adapters.
pub mod http_client;
pub mod trace;

pub use http_client::{HttpClient, HttpClientError, HttpClientResult};
pub use trace::{CountingTracer, LogTracer, NoopTracer, Tracer};
