use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use pingora_core::upstreams::peer::HttpPeer;
use pingora_error::{Error, ErrorType::InternalError, Result};

use super::upstream::UpstreamTarget;
use crate::config;

/// The path predicate of a route.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteMatch {
    Exact(String),
    Prefix(String),
    Default,
}

impl RouteMatch {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            RouteMatch::Exact(uri) => path == uri,
            RouteMatch::Prefix(prefix) => path.starts_with(prefix.as_str()),
            RouteMatch::Default => true,
        }
    }

    /// Sort key: exact first, longer prefixes before shorter, catch-all last.
    fn rank(&self) -> (u8, Reverse<usize>) {
        match self {
            RouteMatch::Exact(_) => (0, Reverse(0)),
            RouteMatch::Prefix(prefix) => (1, Reverse(prefix.len())),
            RouteMatch::Default => (2, Reverse(0)),
        }
    }
}

impl From<&config::Route> for RouteMatch {
    fn from(route: &config::Route) -> Self {
        match (&route.uri, &route.prefix) {
            (Some(uri), _) => RouteMatch::Exact(uri.clone()),
            (None, Some(prefix)) => RouteMatch::Prefix(prefix.clone()),
            (None, None) => RouteMatch::Default,
        }
    }
}

#[derive(Debug)]
pub struct RouteRule {
    pub id: String,
    pub matcher: RouteMatch,
    pub upstream: Arc<UpstreamTarget>,
    /// Forward `Upgrade`/`Connection: upgrade` instead of stripping them.
    pub upgrade: bool,
    pub buffering: bool,
    /// Replace upstream 404 responses with a JSON body.
    pub intercept_errors: bool,
    pub timeout: Option<config::Timeout>,
}

impl RouteRule {
    pub fn peer(&self) -> Box<HttpPeer> {
        self.upstream.peer(self.timeout.as_ref())
    }
}

/// Route rules in match order; the first rule that matches wins.
#[derive(Debug, Default)]
pub struct RouteTable {
    rules: Vec<Arc<RouteRule>>,
}

impl RouteTable {
    /// Orders `rules` by specificity, keeping their relative order otherwise.
    pub fn new(mut rules: Vec<RouteRule>) -> Self {
        rules.sort_by_key(|rule| rule.matcher.rank());
        Self {
            rules: rules.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn from_config(edge: &config::Edge) -> Result<Self> {
        let upstreams: HashMap<&str, Arc<UpstreamTarget>> = edge
            .upstreams
            .iter()
            .map(|u| (u.name.as_str(), Arc::new(UpstreamTarget::from(u))))
            .collect();

        let mut rules = Vec::with_capacity(edge.routes.len());
        for route in &edge.routes {
            let upstream = upstreams.get(route.upstream.as_str()).ok_or_else(|| {
                Error::explain(
                    InternalError,
                    format!("route {} references unknown upstream {}", route.id, route.upstream),
                )
            })?;
            log::info!("Configuring route: {}", route.id);
            rules.push(RouteRule {
                id: route.id.clone(),
                matcher: RouteMatch::from(route),
                upstream: upstream.clone(),
                upgrade: route.upgrade,
                buffering: route.buffering,
                intercept_errors: route.intercept_errors,
                timeout: route.timeout.clone(),
            });
        }

        Ok(Self::new(rules))
    }

    pub fn select(&self, path: &str) -> Option<Arc<RouteRule>> {
        self.rules
            .iter()
            .find(|rule| rule.matcher.matches(path))
            .cloned()
    }

    pub fn rules(&self) -> impl Iterator<Item = &Arc<RouteRule>> {
        self.rules.iter()
    }
}
