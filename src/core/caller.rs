//! Identity of the initiator of a service-to-service call.
//!
//! A [`Caller`] travels inside call metadata and is serialized to a compact
//! prefixed string on the wire (`api:`, `pubsub:`, `app:`, `gateway:`,
//! `encore:`). Parsing is the exact inverse of serialization; an
//! unrecognized prefix is a hard error, never a silent fallback.
use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced when parsing a serialized caller string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CallerParseError {
    /// The string did not start with a known prefix.
    #[error("unknown caller prefix in {0:?}")]
    UnknownPrefix(String),

    /// The payload after the prefix was malformed for that variant.
    #[error("malformed {kind} caller: {input:?}")]
    Malformed {
        /// Variant name the prefix selected
        kind: &'static str,
        /// Full input string
        input: String,
    },
}

/// Closed set of call initiators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Caller {
    /// Another API endpoint in the app.
    Api { service: String, endpoint: String },
    /// A pub/sub subscription delivering a message.
    PubSub {
        topic: String,
        subscription: String,
        message_id: String,
    },
    /// App-internal initiator (cron, startup task) identified by deploy.
    App { deploy_id: String },
    /// A gateway proxying an endpoint hosted elsewhere.
    Gateway { service: String, endpoint: String },
    /// The platform itself (management API, dashboards).
    Platform { principal: String },
}

impl Caller {
    /// Whether this caller is allowed to address private routes.
    pub fn private_routes(&self) -> bool {
        // All in-mesh callers may use private routes; platform calls are
        // verified separately with their own signature.
        match self {
            Caller::Api { .. } | Caller::PubSub { .. } | Caller::App { .. } => true,
            Caller::Gateway { .. } => true,
            Caller::Platform { .. } => false,
        }
    }

    /// Serialize to the wire string form.
    pub fn caller_string(&self) -> String {
        match self {
            Caller::Api { service, endpoint } => format!("api:{service}.{endpoint}"),
            Caller::PubSub {
                topic,
                subscription,
                message_id,
            } => format!("pubsub:{topic}:{subscription}:{message_id}"),
            Caller::App { deploy_id } => format!("app:{deploy_id}"),
            Caller::Gateway { service, endpoint } => format!("gateway:{service}.{endpoint}"),
            Caller::Platform { principal } => format!("encore:{principal}"),
        }
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.caller_string())
    }
}

fn split_service_endpoint(
    kind: &'static str,
    input: &str,
    payload: &str,
) -> Result<(String, String), CallerParseError> {
    match payload.split_once('.') {
        Some((service, endpoint)) if !service.is_empty() && !endpoint.is_empty() => {
            Ok((service.to_string(), endpoint.to_string()))
        }
        _ => Err(CallerParseError::Malformed {
            kind,
            input: input.to_string(),
        }),
    }
}

impl FromStr for Caller {
    type Err = CallerParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, payload) = s
            .split_once(':')
            .ok_or_else(|| CallerParseError::UnknownPrefix(s.to_string()))?;

        match prefix {
            "api" => {
                let (service, endpoint) = split_service_endpoint("api", s, payload)?;
                Ok(Caller::Api { service, endpoint })
            }
            "gateway" => {
                let (service, endpoint) = split_service_endpoint("gateway", s, payload)?;
                Ok(Caller::Gateway { service, endpoint })
            }
            "pubsub" => {
                let mut parts = payload.splitn(3, ':');
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(topic), Some(subscription), Some(message_id))
                        if !topic.is_empty() && !subscription.is_empty() =>
                    {
                        Ok(Caller::PubSub {
                            topic: topic.to_string(),
                            subscription: subscription.to_string(),
                            message_id: message_id.to_string(),
                        })
                    }
                    _ => Err(CallerParseError::Malformed {
                        kind: "pubsub",
                        input: s.to_string(),
                    }),
                }
            }
            "app" => {
                if payload.is_empty() {
                    return Err(CallerParseError::Malformed {
                        kind: "app",
                        input: s.to_string(),
                    });
                }
                Ok(Caller::App {
                    deploy_id: payload.to_string(),
                })
            }
            "encore" => {
                if payload.is_empty() {
                    return Err(CallerParseError::Malformed {
                        kind: "encore",
                        input: s.to_string(),
                    });
                }
                Ok(Caller::Platform {
                    principal: payload.to_string(),
                })
            }
            _ => Err(CallerParseError::UnknownPrefix(s.to_string())),
        }
    }
}
