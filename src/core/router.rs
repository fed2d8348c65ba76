//! Radix-trie path router adapter.
//!
//! Wraps [`matchit`] with the routing policy the serving core needs:
//! * per-method route trees plus a wildcard-method tree (the `*` method is
//!   normalized to an internal sentinel so any-method routes don't collide
//!   with real methods)
//! * percent-decoded matching with a raw-path fallback when the URL carries
//!   an escaped slash (`%2F`) inside a segment
//! * trailing-slash redirect resolution on a primary miss (301 for GET,
//!   308 otherwise; CONNECT never redirects)
//!
//! Endpoint paths use `:name` for named segments and `*name` for a trailing
//! wildcard, translated internally to matchit's `{name}` / `{*name}`.
use std::collections::HashMap;

use axum::http::{Method, StatusCode};
use thiserror::Error;

use crate::core::model::PathParams;

/// Sentinel key for routes registered with the `*` (any) method.
const WILDCARD_METHOD: &str = "!ANY";

/// Errors surfaced while building route tables.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RouterError {
    /// Route registration conflicted with an existing route.
    #[error("conflicting route {method} {path}: {source}")]
    Conflict {
        method: String,
        path: String,
        source: matchit::InsertError,
    },
}

/// Result of a route lookup.
#[derive(Debug)]
pub enum RouteLookup<T> {
    /// A handler matched; params are in route-declaration order.
    Found { handler: T, params: PathParams },
    /// No exact match, but toggling the trailing slash matches.
    Redirect { status: StatusCode, location: String },
    NotFound,
}

/// One routing table: per-method trees plus the wildcard-method tree.
pub struct PathRouter<T> {
    trees: HashMap<String, matchit::Router<T>>,
}

impl<T: Clone> Default for PathRouter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> PathRouter<T> {
    pub fn new() -> Self {
        Self {
            trees: HashMap::new(),
        }
    }

    /// Register a handler for `method` + `path`. A `*` method registers the
    /// route in the wildcard tree, matched for any method without an exact
    /// method match.
    pub fn register(&mut self, method: &str, path: &str, handler: T) -> Result<(), RouterError> {
        let key = if method == "*" {
            WILDCARD_METHOD.to_string()
        } else {
            method.to_ascii_uppercase()
        };
        let trie_path = to_trie_path(path);
        self.trees
            .entry(key)
            .or_default()
            .insert(&trie_path, handler)
            .map_err(|source| RouterError::Conflict {
                method: method.to_string(),
                path: path.to_string(),
                source,
            })
    }

    fn match_in_trees(&self, method: &Method, path: &str) -> Option<(T, PathParams)> {
        let try_tree = |key: &str| -> Option<(T, PathParams)> {
            let tree = self.trees.get(key)?;
            let matched = tree.at(path).ok()?;
            let params = PathParams(
                matched
                    .params
                    .iter()
                    .map(|(name, value)| (name.to_string(), value.to_string()))
                    .collect(),
            );
            Some((matched.value.clone(), params))
        };
        try_tree(method.as_str()).or_else(|| try_tree(WILDCARD_METHOD))
    }

    /// Resolve `method` + the raw (still escaped) request path.
    pub fn lookup(&self, method: &Method, raw_path: &str) -> RouteLookup<T> {
        // Match on the decoded path in the common case. When the URL carries
        // an escaped slash we must match on the raw path instead, otherwise
        // the decoded slash would be treated as a segment boundary.
        let has_escaped_slash = contains_escaped_slash(raw_path);
        let match_path = if has_escaped_slash {
            raw_path.to_string()
        } else {
            decode_path(raw_path)
        };

        if let Some((handler, mut params)) = self.match_in_trees(method, &match_path) {
            if has_escaped_slash {
                // Matched against the raw path; individual param values still
                // carry their escapes.
                for (_, value) in params.0.iter_mut() {
                    *value = decode_path(value);
                }
            }
            return RouteLookup::Found { handler, params };
        }

        // Trailing-slash resolution: re-attempt with the slash toggled and
        // redirect rather than serving directly. CONNECT requests never
        // redirect.
        if *method != Method::CONNECT {
            let toggled = toggle_trailing_slash(&match_path);
            if !toggled.is_empty() && self.match_in_trees(method, &toggled).is_some() {
                let status = if *method == Method::GET {
                    StatusCode::MOVED_PERMANENTLY
                } else {
                    StatusCode::PERMANENT_REDIRECT
                };
                return RouteLookup::Redirect {
                    status,
                    location: toggle_trailing_slash(raw_path),
                };
            }
        }

        RouteLookup::NotFound
    }
}

/// Translate `:name` / `*name` segments to matchit `{name}` / `{*name}`.
fn to_trie_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 4);
    for segment in path.split('/') {
        if segment.is_empty() {
            continue;
        }
        out.push('/');
        if let Some(name) = segment.strip_prefix(':') {
            out.push('{');
            out.push_str(name);
            out.push('}');
        } else if let Some(name) = segment.strip_prefix('*') {
            out.push_str("{*");
            out.push_str(name);
            out.push('}');
        } else {
            out.push_str(segment);
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    if path.ends_with('/') && path != "/" {
        out.push('/');
    }
    out
}

fn contains_escaped_slash(path: &str) -> bool {
    path.as_bytes().windows(3).any(|w| {
        w[0] == b'%' && w[1] == b'2' && (w[2] == b'F' || w[2] == b'f')
    })
}

fn decode_path(path: &str) -> String {
    match urlencoding::decode(path) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => path.to_string(),
    }
}

fn toggle_trailing_slash(path: &str) -> String {
    if path == "/" {
        return String::new();
    }
    match path.strip_suffix('/') {
        Some(stripped) => stripped.to_string(),
        None => format!("{path}/"),
    }
}
