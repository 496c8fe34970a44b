//! Edge routing: the ordered route table and the upstreams it points at.

pub mod route;
pub mod upstream;

use std::sync::Arc;
use std::time::Instant;

use route::RouteRule;

/// Per-request state of the edge proxy.
pub struct EdgeContext {
    pub route: Option<Arc<RouteRule>>,
    pub request_start: Instant,
    /// The upstream answered 404 and the route asked for a JSON body instead.
    pub intercepted: bool,
}

impl Default for EdgeContext {
    fn default() -> Self {
        Self {
            route: None,
            request_start: Instant::now(),
            intercepted: false,
        }
    }
}

impl EdgeContext {
    pub fn route_id(&self) -> &str {
        self.route.as_ref().map_or("", |r| r.id.as_str())
    }

    pub fn upstream_name(&self) -> &str {
        self.route.as_ref().map_or("", |r| r.upstream.name.as_str())
    }
}
