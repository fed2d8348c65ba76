//! Outbound HTTP client adapter using Hyper with Rustls (HTTP/1.1 + HTTP/2).
//!
//! Carries service-to-service calls, remote auth-handler invocations and
//! gateway proxy traffic. Deliberately minimal: retries and circuit breaking,
//! if ever needed, belong in a layer above this adapter.
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use http_body_util::BodyExt;
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult};

/// Per-request deadline covering connect, send and response headers.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
    timeout: Duration,
}

impl HttpClientAdapter {
    /// Create a new client. TLS uses the native root store; ALPN negotiates
    /// h2 where the peer supports it.
    pub fn new() -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false); // Allow HTTPS URLs

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();
        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("Failed to add native certificate to rustls RootCertStore");
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, AxumBody>(https_connector);

        tracing::debug!("Created service-to-service HTTP client");
        Ok(Self {
            client,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Override the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
    ) -> HttpClientResult<Response<AxumBody>> {
        // Set Host header from the target URI
        match req.uri().host() {
            Some(host_str) => {
                let host = match req.uri().port() {
                    Some(port) => format!("{host_str}:{}", port.as_u16()),
                    None => host_str.to_string(),
                };
                if let Ok(value) = HeaderValue::from_str(&host) {
                    req.headers_mut().insert(header::HOST, value);
                }
            }
            None => {
                return Err(HttpClientError::InvalidRequest(
                    "Outgoing URI has no host".to_string(),
                ));
            }
        }

        let (mut parts, body) = req.into_parts();
        // Force HTTP/1.1 on the request; ALPN upgrades to h2 when available.
        parts.version = Version::HTTP_11;
        let outgoing = Request::from_parts(parts, body);

        tracing::debug!(
            method = %outgoing.method(),
            uri = %outgoing.uri(),
            "sending service-to-service request"
        );

        match tokio::time::timeout(self.timeout, self.client.request(outgoing)).await {
            Ok(Ok(response)) => {
                let (mut parts, hyper_body) = response.into_parts();
                // The body is re-framed downstream; drop hop-by-hop framing.
                parts.headers.remove(header::TRANSFER_ENCODING);
                let body = AxumBody::new(hyper_body.map_err(axum::Error::new));
                Ok(Response::from_parts(parts, body))
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "service-to-service request failed");
                Err(HttpClientError::ConnectionError(e.to_string()))
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "service-to-service request timed out");
                Err(HttpClientError::Timeout(self.timeout.as_secs()))
            }
        }
    }
}
