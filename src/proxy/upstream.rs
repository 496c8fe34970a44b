use std::net::SocketAddr;
use std::time::Duration;

use pingora_core::upstreams::peer::HttpPeer;

use crate::config;

/// A fixed upstream address, plain HTTP on loopback in the default layout.
#[derive(Clone, Debug)]
pub struct UpstreamTarget {
    pub name: String,
    pub address: SocketAddr,
    pub timeout: Option<config::Timeout>,
}

impl From<&config::Upstream> for UpstreamTarget {
    fn from(upstream: &config::Upstream) -> Self {
        Self {
            name: upstream.name.clone(),
            address: upstream.address,
            timeout: upstream.timeout.clone(),
        }
    }
}

impl UpstreamTarget {
    /// Builds a peer for one request. A route level timeout wins over the
    /// upstream's own.
    pub fn peer(&self, route_timeout: Option<&config::Timeout>) -> Box<HttpPeer> {
        let mut peer = HttpPeer::new(self.address, false, String::new());
        if let Some(timeout) = route_timeout.or(self.timeout.as_ref()) {
            set_timeout(&mut peer, timeout);
        }
        Box::new(peer)
    }
}

fn set_timeout(p: &mut HttpPeer, timeout: &config::Timeout) {
    p.options.connection_timeout = Some(Duration::from_secs(timeout.connect));
    p.options.read_timeout = Some(Duration::from_secs(timeout.read));
    p.options.write_timeout = Some(Duration::from_secs(timeout.send));
}
