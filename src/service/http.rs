use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, Method, StatusCode};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use pingora::modules::http::compression::ResponseCompressionBuilder;
use pingora::modules::http::HttpModules;
use pingora::server::configuration::ServerConf;
use pingora::services::listening::Service;
use pingora_core::apps::HttpServerOptions;
use pingora_core::listeners::tls::TlsSettings;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_error::{Error, ErrorType::InternalError, Result};
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::{http_proxy_service_with_name, HttpProxy, ProxyHttp, Session};
use prometheus::{
    register_histogram_vec, register_int_counter_vec, HistogramOpts, HistogramVec, IntCounterVec,
};

use crate::config::{Edge, Listener};
use crate::proxy::route::{RouteRule, RouteTable};
use crate::proxy::EdgeContext;
use crate::utils::request::{
    apply_forwarded_headers, apply_upgrade_policy, get_client_ip, is_upgrade_request,
};
use crate::utils::response::{ResponseBuilder, NOT_FOUND_BODY};

const EDGE_SERVICE: &str = "stackgate-edge";

const LATENCY_BUCKETS: &[f64] = &[
    1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0, 30000.0,
    60000.0,
];

static REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "stackgate_edge_requests_total",
        "Requests handled by the stackgate edge",
        &["route", "upstream", "code"]
    )
    .expect("Failed to register prometheus metric: stackgate_edge_requests_total")
});

static LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "stackgate_edge_request_duration_ms",
        "Edge request latency in milliseconds",
    )
    .buckets(LATENCY_BUCKETS.to_vec());
    register_histogram_vec!(opts, &["route"])
        .expect("Failed to register prometheus metric: stackgate_edge_request_duration_ms")
});

static CONNECT_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "stackgate_edge_upstream_connect_failures_total",
        "Failed connection attempts to edge upstreams",
        &["upstream"]
    )
    .expect("Failed to register prometheus metric: stackgate_edge_upstream_connect_failures_total")
});

/// Path based reverse proxy in front of the supervised processes.
pub struct EdgeService {
    routes: Arc<RouteTable>,
    /// Scheme of the listener, reported in `X-Forwarded-Proto`.
    scheme: &'static str,
}

impl EdgeService {
    pub fn new(routes: Arc<RouteTable>, tls: bool) -> Self {
        Self {
            routes,
            scheme: if tls { "https" } else { "http" },
        }
    }
}

#[async_trait]
impl ProxyHttp for EdgeService {
    type CTX = EdgeContext;

    fn new_ctx(&self) -> Self::CTX {
        Self::CTX::default()
    }

    /// Compression stays off; the upstreams decide their own encoding.
    fn init_downstream_modules(&self, modules: &mut HttpModules) {
        modules.add_module(ResponseCompressionBuilder::enable(0));
    }

    async fn early_request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<()> {
        ctx.route = self.routes.select(session.req_header().uri.path());
        Ok(())
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        if ctx.route.is_none() {
            session
                .respond_error(StatusCode::NOT_FOUND.as_u16())
                .await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        match ctx.route.as_ref() {
            Some(route) => Ok(route.peer()),
            None => Error::e_explain(InternalError, "request reached upstream selection without a route"),
        }
    }

    async fn upstream_request_filter(
        &self,
        session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let client_ip = get_client_ip(session);
        apply_forwarded_headers(upstream_request, client_ip.as_deref(), self.scheme)?;

        let upgrade = ctx.route.as_ref().is_some_and(|route| route.upgrade);
        if !upgrade && is_upgrade_request(upstream_request) {
            debug!("route {} does not allow upgrades, stripping", ctx.route_id());
        }
        apply_upgrade_policy(upstream_request, upgrade);
        Ok(())
    }

    async fn response_filter(
        &self,
        session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let Some(route) = ctx.route.as_ref() else {
            return Ok(());
        };
        let body_absent = upstream_body_absent(upstream_response);
        ctx.intercepted = apply_route_response_policy(route, upstream_response)?;

        // A header-only upstream response is never followed by a body filter call.
        if ctx.intercepted && body_absent && session.req_header().method != Method::HEAD {
            session
                .write_response_header(Box::new(upstream_response.clone()), false)
                .await?;
            session
                .write_response_body(Some(Bytes::from_static(NOT_FOUND_BODY)), true)
                .await?;
        }
        Ok(())
    }

    fn response_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<Option<Duration>> {
        if ctx.intercepted {
            replace_intercepted_body(body, end_of_stream);
        }
        Ok(None)
    }

    /// Connect failures go straight to a 502.
    fn fail_to_connect(
        &self,
        _session: &mut Session,
        peer: &HttpPeer,
        ctx: &mut Self::CTX,
        mut e: Box<Error>,
    ) -> Box<Error> {
        warn!(
            "route {} could not reach upstream {} at {peer}: {e}",
            ctx.route_id(),
            ctx.upstream_name()
        );
        CONNECT_FAILURES
            .with_label_values(&[ctx.upstream_name()])
            .inc();
        e.set_retry(false);
        e
    }

    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
        let status = session
            .response_written()
            .map_or(0, |resp| resp.status.as_u16());
        let elapsed = ctx.request_start.elapsed();

        REQUESTS
            .with_label_values(&[ctx.route_id(), ctx.upstream_name(), &status.to_string()])
            .inc();
        LATENCY
            .with_label_values(&[ctx.route_id()])
            .observe(elapsed.as_secs_f64() * 1000.0);

        let req = session.req_header();
        match e {
            Some(e) => warn!(
                "{} {} route={} upstream={} status={status} {elapsed:?}: {e}",
                req.method,
                req.uri,
                ctx.route_id(),
                ctx.upstream_name()
            ),
            None => info!(
                "{} {} route={} upstream={} status={status} {elapsed:?}",
                req.method,
                req.uri,
                ctx.route_id(),
                ctx.upstream_name()
            ),
        }
    }
}

/// Applies a route's response rules. Returns true when the upstream 404 is
/// being replaced by the JSON body.
fn apply_route_response_policy(route: &RouteRule, resp: &mut ResponseHeader) -> Result<bool> {
    let intercept = route.intercept_errors && resp.status == StatusCode::NOT_FOUND;
    if intercept {
        ResponseBuilder::rewrite_as_not_found_json(resp)?;
    }
    if !route.buffering {
        resp.insert_header("X-Accel-Buffering", "no")?;
    }
    Ok(intercept)
}

/// True when the upstream response has no body to stream.
///
/// By the time `response_filter` runs, unframed responses that still carry a
/// body have been switched to chunked, so no framing at all means no body.
fn upstream_body_absent(resp: &ResponseHeader) -> bool {
    match resp.headers.get(header::CONTENT_LENGTH) {
        Some(length) => length
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            == Some(0),
        None => !resp.headers.contains_key(header::TRANSFER_ENCODING),
    }
}

/// Drops every upstream chunk and emits the JSON body once, at the end.
fn replace_intercepted_body(body: &mut Option<Bytes>, end_of_stream: bool) {
    *body = end_of_stream.then(|| Bytes::from_static(NOT_FOUND_BODY));
}

/// One proxy service per configured listener, all sharing one route table.
pub fn build_edge_services(
    server_conf: &Arc<ServerConf>,
    edge: &Edge,
) -> Result<Vec<Service<HttpProxy<EdgeService>>>> {
    let routes = Arc::new(RouteTable::from_config(edge)?);

    edge.listeners
        .iter()
        .map(|listener| {
            let app = EdgeService::new(routes.clone(), listener.tls.is_some());
            let mut service = http_proxy_service_with_name(server_conf, app, EDGE_SERVICE);
            add_listener(&mut service, listener)?;
            Ok(service)
        })
        .collect()
}

fn add_listener(service: &mut Service<HttpProxy<EdgeService>>, listener: &Listener) -> Result<()> {
    let address = listener.address.to_string();
    log::info!("Adding edge listener {address}");

    match &listener.tls {
        Some(tls) => {
            let mut settings = TlsSettings::intermediate(&tls.cert_path, &tls.key_path)?;
            if listener.offer_h2 {
                settings.enable_h2();
            }
            service.add_tls_with_settings(&address, None, settings);
        }
        None => {
            if listener.offer_h2c {
                if let Some(http_logic) = service.app_logic_mut() {
                    let mut http_server_options = HttpServerOptions::default();
                    http_server_options.h2c = true;
                    http_logic.server_options = Some(http_server_options);
                }
            }
            service.add_tcp(&address);
        }
    }
    Ok(())
}
