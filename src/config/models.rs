//! Runtime configuration data structures.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files.
//! They are intentionally serde-friendly and include defaults so minimal
//! configs remain concise. The generated application supplies this config at
//! startup; none of it is mutated at runtime.
use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};

use crate::adapters::call_meta::{PlatformKey, SvcAuth};

fn default_listen_addr() -> String {
    "127.0.0.1:4000".to_string()
}

/// Top-level runtime configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Address the HTTP listener binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Deployment metadata reported by the health surface
    pub app: AppMeta,
    /// Names of the services hosted by this instance
    pub hosted_services: Vec<String>,
    /// Externally-facing gateway declarations; a non-empty list makes this
    /// instance proxy endpoints hosted elsewhere
    pub gateways: Vec<String>,
    /// Service name -> base URL for peers not hosted in this instance
    pub service_discovery: HashMap<String, String>,
    /// Which service hosts the auth handler, if the app has one
    pub auth_handler_service: Option<String>,
    /// Service-to-service request signing
    pub svc_auth: SvcAuthConfig,
    /// Platform signing keys (rotatable, id-tagged)
    pub platform_keys: Vec<PlatformKeyConfig>,
    /// Graceful shutdown timing
    pub shutdown: ShutdownConfig,
}

// Hand-written so constructed defaults match deserialized ones; the serde
// field default only applies when deserializing.
impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            app: AppMeta::default(),
            hosted_services: Vec::new(),
            gateways: Vec::new(),
            service_discovery: HashMap::new(),
            auth_handler_service: None,
            svc_auth: SvcAuthConfig::default(),
            platform_keys: Vec::new(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

/// Deployment metadata surfaced through the internal health endpoint.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppMeta {
    pub app_revision: String,
    pub deploy_id: String,
    pub compiler_version: String,
    pub enabled_experiments: Vec<String>,
}

/// Service-to-service auth scheme selection.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SvcAuthConfig {
    /// No signing (local development)
    #[default]
    Noop,
    /// HMAC-SHA256 keyed by environment
    Hmac {
        key_id: u32,
        /// Base64-encoded key material
        key: String,
    },
}

impl SvcAuthConfig {
    pub fn to_svc_auth(&self) -> Result<SvcAuth> {
        match self {
            SvcAuthConfig::Noop => Ok(SvcAuth::Noop),
            SvcAuthConfig::Hmac { key_id, key } => {
                let key = BASE64
                    .decode(key)
                    .context("svc_auth.key is not valid base64")?;
                if key.is_empty() {
                    return Err(eyre!("svc_auth.key must not be empty"));
                }
                Ok(SvcAuth::Hmac {
                    key_id: *key_id,
                    key,
                })
            }
        }
    }
}

/// One platform signing key.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PlatformKeyConfig {
    pub id: u32,
    /// Base64-encoded key material
    pub key: String,
}

impl PlatformKeyConfig {
    pub fn to_platform_key(&self) -> Result<PlatformKey> {
        let key = BASE64
            .decode(&self.key)
            .with_context(|| format!("platform key {} is not valid base64", self.id))?;
        Ok(PlatformKey { id: self.id, key })
    }
}

/// Graceful shutdown timing knobs, humantime duration strings.
///
/// The keep-accepting window is recomputed from the Kubernetes-style
/// termination grace period hint when one is present in the environment;
/// see `utils::graceful_shutdown`.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Keep accepting new connections for this long after the trigger
    pub keep_accepting: String,
    /// Cancel outstanding task contexts this long after the trigger
    pub cancel_tasks_after: String,
    /// Extra time before force-closing canceled tasks
    pub force_close_grace: String,
    /// Force shutdown this long after the trigger
    pub force_shutdown_after: String,
    /// Extra time for hooks to wind down once force shutdown begins
    pub force_shutdown_grace: String,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            keep_accepting: "1s".to_string(),
            cancel_tasks_after: "5s".to_string(),
            force_close_grace: "1s".to_string(),
            force_shutdown_after: "8s".to_string(),
            force_shutdown_grace: "1s".to_string(),
        }
    }
}

impl ShutdownConfig {
    fn parse(field: &str, value: &str) -> Result<std::time::Duration> {
        humantime::parse_duration(value)
            .with_context(|| format!("shutdown.{field} is not a valid duration: {value:?}"))
    }

    pub fn keep_accepting(&self) -> Result<std::time::Duration> {
        Self::parse("keep_accepting", &self.keep_accepting)
    }

    pub fn cancel_tasks_after(&self) -> Result<std::time::Duration> {
        Self::parse("cancel_tasks_after", &self.cancel_tasks_after)
    }

    pub fn force_close_grace(&self) -> Result<std::time::Duration> {
        Self::parse("force_close_grace", &self.force_close_grace)
    }

    pub fn force_shutdown_after(&self) -> Result<std::time::Duration> {
        Self::parse("force_shutdown_after", &self.force_shutdown_after)
    }

    pub fn force_shutdown_grace(&self) -> Result<std::time::Duration> {
        Self::parse("force_shutdown_grace", &self.force_shutdown_grace)
    }
}

impl RuntimeConfig {
    /// Whether `service` runs inside this instance.
    pub fn hosts_service(&self, service: &str) -> bool {
        self.hosted_services.iter().any(|s| s == service)
    }

    /// Whether this instance acts as a gateway for remote endpoints.
    pub fn is_gateway(&self) -> bool {
        !self.gateways.is_empty()
    }

    /// Resolve the base URL for a peer service.
    pub fn service_url(&self, service: &str) -> Option<&str> {
        self.service_discovery.get(service).map(String::as_str)
    }
}
