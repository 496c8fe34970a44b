//! Loopback HTTP/JSON control surface for the process supervisor.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;

use async_trait::async_trait;
use http::{Method, Response, StatusCode};
use matchit::{InsertError, Match, Router};
use pingora::{
    apps::http_app::ServeHttp, protocols::http::ServerSession, services::listening::Service,
};
use pingora_error::{ErrorType::InternalError, OrErr, Result};
use serde_json::json;

use crate::error::SupervisorError;
use crate::supervisor::SupervisorHandle;
use crate::utils::response::ResponseBuilder;

type Params = BTreeMap<String, String>;
type HandlerResult = std::result::Result<Response<Vec<u8>>, SupervisorError>;

#[async_trait]
trait Handler {
    async fn handle(&self, supervisor: &SupervisorHandle, params: &Params) -> HandlerResult;
}

pub struct ControlHttpApp {
    supervisor: SupervisorHandle,
    router: Router<HashMap<Method, Box<dyn Handler + Send + Sync>>>,
}

impl ControlHttpApp {
    pub fn new(supervisor: SupervisorHandle) -> std::result::Result<Self, InsertError> {
        let mut this = Self {
            supervisor,
            router: Router::new(),
        };

        this.route("/status", Method::GET, Box::new(StatusHandler))?
            .route("/processes", Method::GET, Box::new(ListHandler))?
            .route("/processes/{name}", Method::GET, Box::new(GetHandler))?
            .route(
                "/processes/{name}/{action}",
                Method::POST,
                Box::new(ActionHandler),
            )?;

        Ok(this)
    }

    fn route(
        &mut self,
        path: &str,
        method: Method,
        handler: Box<dyn Handler + Send + Sync>,
    ) -> std::result::Result<&mut Self, InsertError> {
        match self.router.at_mut(path) {
            Ok(found) => {
                found.value.insert(method, handler);
            }
            Err(_) => {
                let mut handlers = HashMap::new();
                handlers.insert(method, handler);
                self.router.insert(path, handlers)?;
            }
        }
        Ok(self)
    }

    pub fn control_http_service(
        address: SocketAddr,
        supervisor: SupervisorHandle,
    ) -> Result<Service<Self>> {
        let app = Self::new(supervisor)
            .or_err(InternalError, "Failed to build control surface routes")?;
        let mut service = Service::new("Control HTTP".to_string(), app);
        service.add_tcp(&address.to_string());
        Ok(service)
    }

    async fn dispatch(&self, method: &Method, path: &str) -> Response<Vec<u8>> {
        let Ok(Match { value, params }) = self.router.at(path) else {
            return ResponseBuilder::error_json(StatusCode::NOT_FOUND, "Not Found");
        };
        let Some(handler) = value.get(method) else {
            return ResponseBuilder::error_json(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
        };

        let params: Params = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        match handler.handle(&self.supervisor, &params).await {
            Ok(resp) => resp,
            Err(e) => {
                log::warn!("Control request {method} {path} failed: {e}");
                error_response(&e)
            }
        }
    }
}

#[async_trait]
impl ServeHttp for ControlHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        http_session.set_keepalive(None);

        let (path, method) = {
            let req_header = http_session.req_header();
            (req_header.uri.path().to_string(), req_header.method.clone())
        };
        log::debug!("Control request {method} {path}");

        self.dispatch(&method, &path).await
    }
}

fn error_response(e: &SupervisorError) -> Response<Vec<u8>> {
    let status = match e {
        SupervisorError::UnknownProcess(_) => StatusCode::NOT_FOUND,
        SupervisorError::InvalidTransition { .. } => StatusCode::CONFLICT,
        SupervisorError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    ResponseBuilder::error_json(status, &e.to_string())
}

fn param<'a>(params: &'a Params, key: &str) -> &'a str {
    params.get(key).map_or("", String::as_str)
}

struct StatusHandler;

#[async_trait]
impl Handler for StatusHandler {
    async fn handle(&self, supervisor: &SupervisorHandle, _params: &Params) -> HandlerResult {
        let snapshot = supervisor.snapshot();
        if snapshot.is_healthy() {
            return Ok(ResponseBuilder::success_json(&json!({ "status": "ok" })));
        }
        Ok(ResponseBuilder::json(
            StatusCode::SERVICE_UNAVAILABLE,
            &json!({ "status": "fault", "fatal": snapshot.fatal() }),
        ))
    }
}

struct ListHandler;

#[async_trait]
impl Handler for ListHandler {
    async fn handle(&self, supervisor: &SupervisorHandle, _params: &Params) -> HandlerResult {
        Ok(ResponseBuilder::success_json(&*supervisor.snapshot()))
    }
}

struct GetHandler;

#[async_trait]
impl Handler for GetHandler {
    async fn handle(&self, supervisor: &SupervisorHandle, params: &Params) -> HandlerResult {
        let name = param(params, "name");
        let snapshot = supervisor.snapshot();
        let process = snapshot
            .process(name)
            .ok_or_else(|| SupervisorError::UnknownProcess(name.to_string()))?;
        Ok(ResponseBuilder::success_json(process))
    }
}

struct ActionHandler;

#[async_trait]
impl Handler for ActionHandler {
    async fn handle(&self, supervisor: &SupervisorHandle, params: &Params) -> HandlerResult {
        let name = param(params, "name");
        let process = match param(params, "action") {
            "start" => supervisor.start(name).await?,
            "stop" => supervisor.stop(name).await?,
            "restart" => supervisor.restart(name).await?,
            other => {
                return Ok(ResponseBuilder::error_json(
                    StatusCode::BAD_REQUEST,
                    &format!("unsupported action: {other}"),
                ))
            }
        };
        log::info!("Control action {} applied to {name}", param(params, "action"));
        Ok(ResponseBuilder::success_json(&process))
    }
}
