//! Path-prefix route table and longest-prefix matching.
//!
//! The table is built once from validated configuration and shared read-only
//! between every connection task, so lookups take no locks.

use crate::egress::EgressConfig;
use crate::error::GatewayError;
use hyper::Uri;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub prefix: String,
    pub target_base: String,
    pub egress: Option<EgressConfig>,
}

impl Route {
    pub fn new(prefix: impl Into<String>, target_base: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            target_base: target_base.into(),
            egress: None,
        }
    }

    pub fn with_egress(mut self, egress: EgressConfig) -> Self {
        self.egress = Some(egress);
        self
    }
}

/// Result of a successful prefix lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefixMatch<'a, 'p> {
    pub route: &'a Route,
    pub remainder: &'p str,
}

impl PrefixMatch<'_, '_> {
    pub fn prefix(&self) -> &str {
        &self.route.prefix
    }

    /// `target_base + remainder`, plus `?query` only when the query is non-empty.
    pub fn target_url(&self, query: Option<&str>) -> String {
        build_target_url(&self.route.target_base, self.remainder, query)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    // Longest prefix first, ties broken lexicographically.
    routes: Vec<Route>,
}

impl RouteTable {
    /// Builds the table, rejecting empty prefixes, empty targets and duplicates.
    pub fn new(routes: Vec<Route>) -> Result<Self, GatewayError> {
        let mut by_prefix = BTreeMap::new();
        for route in routes {
            if route.prefix.is_empty() {
                return Err(GatewayError::Config("route prefix cannot be empty".to_string()));
            }
            if route.target_base.is_empty() {
                return Err(GatewayError::Config(format!(
                    "target URL for prefix {} cannot be empty",
                    route.prefix
                )));
            }
            let prefix = route.prefix.clone();
            if by_prefix.insert(prefix.clone(), route).is_some() {
                return Err(GatewayError::Config(format!("duplicate route prefix {}", prefix)));
            }
        }

        let mut routes: Vec<Route> = by_prefix.into_values().collect();
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()).then_with(|| a.prefix.cmp(&b.prefix)));
        Ok(Self { routes })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn get(&self, prefix: &str) -> Option<&Route> {
        self.routes.iter().find(|route| route.prefix == prefix)
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    /// Finds the longest prefix `path` starts with.
    ///
    /// Matching is a plain string comparison with no segment boundary:
    /// `/api` matches `/apiv1` and leaves `v1`. When the prefix ends in `/`
    /// and the remainder starts with `/`, one slash is dropped so the join
    /// onto the target base does not double it.
    pub fn match_path<'a, 'p>(&'a self, path: &'p str) -> Option<PrefixMatch<'a, 'p>> {
        // Sorted longest first, so the first hit is the longest match.
        let route = self.routes.iter().find(|route| path.starts_with(route.prefix.as_str()))?;
        let mut remainder = &path[route.prefix.len()..];
        if route.prefix.ends_with('/') && remainder.starts_with('/') {
            remainder = &remainder[1..];
        }
        Some(PrefixMatch { route, remainder })
    }
}

/// Literal concatenation; no separator is inserted between base and remainder.
pub fn build_target_url(target_base: &str, remainder: &str, query: Option<&str>) -> String {
    match query.filter(|q| !q.is_empty()) {
        Some(query) => format!("{}{}?{}", target_base, remainder, query),
        None => format!("{}{}", target_base, remainder),
    }
}

/// Parses a built target URL, requiring an absolute `http`/`https` URI with a host.
pub fn parse_target_uri(target_url: &str) -> Result<Uri, GatewayError> {
    let invalid = |reason: String| GatewayError::TargetUrl {
        url: target_url.to_string(),
        reason,
    };

    let uri: Uri = target_url.parse().map_err(|e: hyper::http::uri::InvalidUri| invalid(e.to_string()))?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        Some(other) => return Err(invalid(format!("unsupported scheme {}", other))),
        None => return Err(invalid("missing scheme".to_string())),
    }
    if uri.host().map_or(true, str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }
    Ok(uri)
}
