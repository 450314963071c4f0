//! Ordered route table for the gateway
//!
//! Routes are fixed at startup and matched first-match-wins. The matcher is
//! a pure function of the request path; it never inspects headers or method,
//! so dispatch decisions are trivially reproducible.

use crate::config::Config;
use hyper::Method;

/// Health check endpoint path
const HEALTH_PATH: &str = "/api/health";

/// The handler a request path resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum Route<'a> {
    /// Static asset; carries the path remainder after the static prefix
    Asset(&'a str),
    /// The fixed dashboard page at `/`
    Index,
    /// The fixed health check document
    Health,
    /// Reverse proxy; carries the path remainder after the route prefix
    /// (leading slash included, empty when the prefix matched exactly)
    Upstream(&'a str),
}

/// Route table built from configuration at startup, immutable afterwards.
#[derive(Debug, Clone)]
pub struct RouteTable {
    static_prefix: String,
    upstream_prefix: String,
}

impl RouteTable {
    pub fn from_config(config: &Config) -> Self {
        Self {
            static_prefix: config.content.static_prefix.clone(),
            upstream_prefix: config.upstream.route_prefix.clone(),
        }
    }

    /// Match a request against the table. Locally served routes (assets,
    /// page, health) answer GET and HEAD only; other methods fall through
    /// to 404. The upstream route forwards any method.
    pub fn match_request<'a>(&self, method: &Method, path: &'a str) -> Option<Route<'a>> {
        let route = self.match_path(path)?;
        match route {
            Route::Upstream(_) => Some(route),
            _ if method == Method::GET || method == Method::HEAD => Some(route),
            _ => None,
        }
    }

    /// Match a request path against the table, in order:
    /// static prefix, `/` exact, health exact, upstream prefix.
    /// Returns None when nothing matches (caller responds 404).
    pub fn match_path<'a>(&self, path: &'a str) -> Option<Route<'a>> {
        if let Some(rest) = strip_route_prefix(path, &self.static_prefix) {
            return Some(Route::Asset(rest));
        }
        if path == "/" {
            return Some(Route::Index);
        }
        if path == HEALTH_PATH {
            return Some(Route::Health);
        }
        if let Some(rest) = strip_route_prefix(path, &self.upstream_prefix) {
            return Some(Route::Upstream(rest));
        }
        None
    }
}

/// Strip a route prefix from a path. Matches the prefix exactly or followed
/// by a slash; `/streamlitfoo` does not match the `/streamlit` prefix.
fn strip_route_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}
