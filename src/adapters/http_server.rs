//! HTTP listener: binds the configured address and feeds every inbound
//! request through [`Server::handle`].
//!
//! Connection acceptance stops once shutdown is triggered, even when the
//! trigger fired before serving started; in-flight requests keep running
//! and are drained by the shutdown coordinator.
use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::Request,
    response::Response,
    routing::any,
};
use eyre::{Context, Result};

use crate::{core::server::Server, utils::graceful_shutdown::GracefulShutdown};

pub struct HttpServer {
    server: Arc<Server>,
    shutdown: Arc<GracefulShutdown>,
    listener: tokio::net::TcpListener,
    local_addr: SocketAddr,
}

impl HttpServer {
    /// Bind the listen address from the server's runtime config.
    pub async fn bind(server: Arc<Server>, shutdown: Arc<GracefulShutdown>) -> Result<Self> {
        let addr: SocketAddr = server
            .config()
            .listen_addr
            .parse()
            .context("failed to parse listen address")?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .context("failed to bind to address")?;
        let local_addr = listener.local_addr().context("failed to get local addr")?;
        Ok(Self {
            server,
            shutdown,
            listener,
            local_addr,
        })
    }

    /// The bound address, useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until shutdown is triggered, then stop accepting.
    pub async fn serve(self) -> Result<()> {
        let make_route = |server: Arc<Server>| {
            any(move |req: Request| {
                let server = server.clone();
                async move { Ok::<Response, Infallible>(server.handle(req).await) }
            })
        };

        let app = Router::new()
            .route("/", make_route(self.server.clone()))
            .route("/{*path}", make_route(self.server.clone()));

        tracing::info!(addr = %self.local_addr, "listening");

        tokio::select! {
            result = axum::serve(self.listener, app.into_make_service()) => {
                result.context("server error")
            }
            reason = self.shutdown.triggered() => {
                tracing::info!(?reason, "listener stopping");
                Ok(())
            }
        }
    }
}
