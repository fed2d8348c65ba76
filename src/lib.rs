//! Synapse - the request-serving core of a backend application runtime.
//!
//! Synapse hosts the API endpoints of a generated application behind a single
//! HTTP listener, implementing a **hexagonal architecture**: business logic in
//! `core`, traits in `ports`, I/O in `adapters`. It focuses on correctness of
//! request tracking, observability, and predictable shutdown.
//!
//! # Features
//! - Method-aware path routing with parameters, wildcards and trailing-slash
//!   redirects, split across public/private route tables with fallback pairs
//! - Typed and raw endpoint dispatch with per-request tracking spans
//! - App-defined middleware chains (global and per-service) with contained
//!   handler panics
//! - A single app-wide auth handler, local or forwarded to its hosting service
//! - Call-metadata propagation for service-to-service calls (trace context,
//!   caller identity, propagated auth) with HMAC request signing
//! - Gateway proxying for endpoints hosted in other instances
//! - Push-based pub/sub message delivery and an internal health surface
//! - Staged graceful shutdown with orchestrator grace-period awareness
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use synapse::{
//!     adapters::HttpServer,
//!     config::load_config,
//!     core::ServerBuilder,
//!     utils::{GracefulShutdown, ShutdownTimings},
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = load_config("runtime.toml")?;
//! let timings = ShutdownTimings::from_config(&config.shutdown)?.with_external_grace_env();
//! let server = ServerBuilder::new(config).build()?;
//! let shutdown = GracefulShutdown::new(server.clone(), timings);
//! tokio::spawn(shutdown.clone().run_signal_handler());
//!
//! let listener = HttpServer::bind(server, shutdown.clone()).await?;
//! tokio::spawn(listener.serve());
//! let report = shutdown.process().await;
//! std::process::exit(report.exit_code());
//! # }
//! ```
//!
//! # Error Handling
//! Request-path failures use the domain error type [`error::ApiError`], which
//! carries a wire-stable code; startup and configuration errors return
//! `eyre::Result<T>` with context attached via `WrapErr`.
//!
//! # Concurrency & Data Structures
//! For shared mutable maps the project uses `scc::HashMap` instead of `dashmap`
//! to maintain predictable performance characteristics under contention.
//!
//! # License
//! Licensed under the Apache License, Version 2.0.
pub mod config;
pub mod error;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

// These modules are implementation details and should not be directly used by users
pub mod adapters;
pub mod core;

// Re-export the types most applications wire together at startup
pub use crate::{
    adapters::{HttpClientAdapter, HttpServer, MetaCodec},
    core::{Authenticator, Registry, Server, ServerBuilder},
    error::{ApiError, ApiResult, ErrCode},
    ports::http_client::HttpClient,
    utils::{GracefulShutdown, ShutdownTimings},
};
