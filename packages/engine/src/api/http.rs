// packages/engine/src/api/http.rs
//! HTTP control surface
//!
//! Callers identify themselves with the `x-fnrt-principal` header; every
//! route except `/health` and `/metrics` is checked against the
//! [`PermissionGate`] before it touches the runtime.

use crate::codec::Value;
use crate::functions::{Function, FunctionRef};
use crate::runtime::WorkerInfo;
use crate::security::{execute_permission, PermissionGate};
use crate::service::{FunctionRuntime, Invoker};
use crate::tracking::{Execution, TriggerContext, TriggerKind};
use crate::triggers::{Schedule, Scheduler};
use crate::utils::errors::{EngineError, Result, ValidationError};
use crate::VERSION;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full, Limited};
use hyper::{
    body, header,
    server::conn::http1,
    service::service_fn,
    Method, Request, Response, StatusCode, Uri,
};
use hyper_util::rt::TokioIo;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const PRINCIPAL_HEADER: &str = "x-fnrt-principal";

/// Permissions guarding the control routes
pub mod permissions {
    pub const WORKERS_READ: &str = "fnrt.workers.read:all";
    pub const WORKERS_SCALE: &str = "fnrt.workers.scale:all";
    pub const EXECUTIONS_READ: &str = "fnrt.executions.read:all";
    pub const SCHEDULES_READ: &str = "fnrt.schedules.read:all";
    pub const SCHEDULES_WRITE: &str = "fnrt.schedules.write:all";
    pub const FUNCTIONS_WRITE: &str = "fnrt.functions.write:all";
}

const DEFAULT_LIST_LIMIT: usize = 50;

pub type ApiBody = BoxBody<Bytes, hyper::Error>;

fn empty() -> ApiBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn full<T: Into<Bytes>>(chunk: T) -> ApiBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ApiBody> {
    match serde_json::to_vec(value) {
        Ok(bytes) => {
            let mut response = Response::new(full(bytes));
            *response.status_mut() = status;
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(e) => error_response(&EngineError::Serialization(e)),
    }
}

fn status_for(error: &EngineError) -> StatusCode {
    match error {
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        EngineError::Validation(_)
        | EngineError::SchemaValidation(_)
        | EngineError::OutOfRange { .. } => StatusCode::BAD_REQUEST,
        EngineError::WorkerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: &EngineError) -> Response<ApiBody> {
    let status = status_for(error);
    let body = serde_json::json!({
        "error": error.to_string(),
        "kind": error.kind(),
    });
    let mut response = Response::new(full(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

fn bad_request(reason: impl Into<String>) -> EngineError {
    EngineError::Validation(ValidationError::new(reason, None))
}

fn parse_body<T: for<'de> Deserialize<'de>>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| bad_request(format!("invalid request body: {}", e)))
}

/// First value of `key` in the query string, percent-decoded
fn query_param(uri: &Uri, key: &str) -> Option<String> {
    url::form_urlencoded::parse(uri.query()?.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

#[derive(Debug, Deserialize)]
struct ScaleRequest {
    target_count: i64,
}

/// Worker row as listed by `GET /workers`
#[derive(Debug, Serialize)]
struct WorkerView {
    id: String,
    container_name: String,
    status: &'static str,
    created_at: chrono::DateTime<chrono::Utc>,
    executions: u64,
}

impl From<WorkerInfo> for WorkerView {
    fn from(info: WorkerInfo) -> Self {
        Self {
            id: info.id,
            container_name: info.container_name,
            status: info.status.as_str(),
            created_at: info.created_at,
            executions: info.executions,
        }
    }
}

/// What a webhook caller gets back
#[derive(Debug, Serialize)]
struct ExecutionSummary {
    execution_id: String,
    status: &'static str,
    output: Option<serde_json::Value>,
    error: Option<crate::tracking::ExecutionError>,
    duration_ms: Option<u64>,
    worker_id: Option<String>,
}

impl From<Execution> for ExecutionSummary {
    fn from(execution: Execution) -> Self {
        Self {
            execution_id: execution.id,
            status: execution.status.as_str(),
            output: execution.output.as_ref().map(Value::to_json),
            error: execution.error,
            duration_ms: execution.duration_ms,
            worker_id: execution.worker_id,
        }
    }
}

#[derive(Debug, Serialize)]
struct ScheduleView {
    #[serde(flatten)]
    schedule: Schedule,
    next_fire: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Clone)]
pub struct ApiServer {
    runtime: Arc<FunctionRuntime>,
    scheduler: Arc<Scheduler>,
    gate: Arc<dyn PermissionGate>,
    metrics: Option<PrometheusHandle>,
    max_body_bytes: usize,
}

impl ApiServer {
    pub fn new(
        runtime: Arc<FunctionRuntime>,
        scheduler: Arc<Scheduler>,
        gate: Arc<dyn PermissionGate>,
        metrics: Option<PrometheusHandle>,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            runtime,
            scheduler,
            gate,
            metrics,
            max_body_bytes,
        }
    }

    /// Accept connections until `shutdown` is cancelled
    pub async fn run(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!(addr = ?listener.local_addr().ok(), "HTTP API listening");
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted?,
            };

            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::task::spawn(async move {
                if let Err(err) = http1::Builder::new()
                    .serve_connection(
                        io,
                        service_fn(|request: Request<body::Incoming>| async {
                            server.routes(request).await
                        }),
                    )
                    .await
                {
                    debug!(%peer, error = %err, "connection closed with error");
                }
            });
        }
        info!("HTTP API stopped");
        Ok(())
    }

    async fn routes(
        &self,
        request: Request<body::Incoming>,
    ) -> std::result::Result<Response<ApiBody>, Infallible> {
        let (parts, body) = request.into_parts();
        let principal = parts
            .headers
            .get(PRINCIPAL_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = match Limited::new(body, self.max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(path = parts.uri.path(), error = %e, "rejecting request body");
                let mut response = Response::new(empty());
                *response.status_mut() = StatusCode::PAYLOAD_TOO_LARGE;
                return Ok(response);
            }
        };

        Ok(self
            .handle(&parts.method, &parts.uri, principal.as_deref(), body)
            .await)
    }

    /// Route one request whose body has already been read
    pub async fn handle(
        &self,
        method: &Method,
        uri: &Uri,
        principal: Option<&str>,
        body: Bytes,
    ) -> Response<ApiBody> {
        let segments: Vec<&str> = uri.path().trim_matches('/').split('/').collect();

        let result = match (method, segments.as_slice()) {
            (&Method::GET, ["health"]) => Ok(self.health()),
            (&Method::GET, ["metrics"]) => Ok(self.metrics()),
            (&Method::GET, ["workers"]) => self.list_workers(principal),
            (&Method::GET, ["workers", "count"]) => self.count_workers(principal),
            (&Method::POST, ["workers", "scale"]) => self.scale_workers(principal, &body).await,
            (&Method::POST, ["webhooks", namespace, name]) => {
                self.webhook(principal, namespace, name, uri, &body).await
            }
            (&Method::GET, ["executions"]) => self.list_executions(principal, uri),
            (&Method::GET, ["executions", id]) => self.get_execution(principal, id),
            (&Method::GET, ["schedules"]) => self.list_schedules(principal),
            (&Method::POST, ["schedules"]) => self.register_schedule(principal, &body),
            (&Method::DELETE, ["schedules", name]) => self.remove_schedule(principal, name),
            (&Method::POST, ["functions"]) => self.put_function(principal, &body),
            _ => {
                let mut not_found = Response::new(empty());
                *not_found.status_mut() = StatusCode::NOT_FOUND;
                Ok(not_found)
            }
        };

        result.unwrap_or_else(|e| {
            debug!(%method, path = uri.path(), error = %e, "request failed");
            error_response(&e)
        })
    }

    fn health(&self) -> Response<ApiBody> {
        json_response(
            StatusCode::OK,
            &serde_json::json!({
                "status": "ok",
                "version": VERSION,
                "workers": self.runtime.pool().count(),
            }),
        )
    }

    fn metrics(&self) -> Response<ApiBody> {
        match &self.metrics {
            Some(handle) => {
                let mut response = Response::new(full(handle.render()));
                response.headers_mut().insert(
                    header::CONTENT_TYPE,
                    header::HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                response
            }
            None => {
                let mut response = Response::new(empty());
                *response.status_mut() = StatusCode::NOT_FOUND;
                response
            }
        }
    }

    fn list_workers(&self, principal: Option<&str>) -> Result<Response<ApiBody>> {
        self.gate.require(principal, permissions::WORKERS_READ)?;
        let workers: Vec<WorkerView> = self
            .runtime
            .pool()
            .list_workers()
            .into_iter()
            .map(WorkerView::from)
            .collect();
        Ok(json_response(StatusCode::OK, &workers))
    }

    fn count_workers(&self, principal: Option<&str>) -> Result<Response<ApiBody>> {
        self.gate.require(principal, permissions::WORKERS_READ)?;
        Ok(json_response(
            StatusCode::OK,
            &serde_json::json!({ "count": self.runtime.pool().count() }),
        ))
    }

    async fn scale_workers(&self, principal: Option<&str>, body: &Bytes) -> Result<Response<ApiBody>> {
        self.gate.require(principal, permissions::WORKERS_SCALE)?;
        let request: ScaleRequest = parse_body(body)?;
        let report = self.runtime.pool().scale(request.target_count).await?;
        Ok(json_response(StatusCode::OK, &report))
    }

    async fn webhook(
        &self,
        principal: Option<&str>,
        namespace: &str,
        name: &str,
        uri: &Uri,
        body: &Bytes,
    ) -> Result<Response<ApiBody>> {
        self.gate.require(principal, &execute_permission(namespace, name))?;

        let input = if body.iter().all(u8::is_ascii_whitespace) {
            Value::Null
        } else {
            Value::from_json(parse_body(body)?)
        };
        let function_ref = FunctionRef::new(namespace, name);
        let mut trigger = TriggerContext::new(TriggerKind::Webhook).with_source(uri.path());
        if let Some(principal) = principal {
            trigger = trigger.with_principal(principal);
        }

        if query_param(uri, "async").as_deref() == Some("true") {
            let execution_id = self.runtime.submit(&function_ref, input, trigger)?;
            return Ok(json_response(
                StatusCode::ACCEPTED,
                &serde_json::json!({ "execution_id": execution_id }),
            ));
        }

        let execution_id = self.runtime.invoke(&function_ref, input, trigger).await?;
        let detail = self.runtime.get_execution(&execution_id)?;
        Ok(json_response(
            StatusCode::OK,
            &ExecutionSummary::from(detail.execution),
        ))
    }

    fn list_executions(&self, principal: Option<&str>, uri: &Uri) -> Result<Response<ApiBody>> {
        self.gate.require(principal, permissions::EXECUTIONS_READ)?;
        let limit = match query_param(uri, "limit") {
            Some(raw) => raw
                .parse()
                .map_err(|_| bad_request(format!("invalid limit '{}'", raw)))?,
            None => DEFAULT_LIST_LIMIT,
        };
        let executions = self
            .runtime
            .list_executions(query_param(uri, "function").as_deref(), limit)?;
        let summaries: Vec<ExecutionSummary> =
            executions.into_iter().map(ExecutionSummary::from).collect();
        Ok(json_response(StatusCode::OK, &summaries))
    }

    fn get_execution(&self, principal: Option<&str>, id: &str) -> Result<Response<ApiBody>> {
        self.gate.require(principal, permissions::EXECUTIONS_READ)?;
        let detail = self.runtime.get_execution(id)?;
        Ok(json_response(StatusCode::OK, &detail))
    }

    fn list_schedules(&self, principal: Option<&str>) -> Result<Response<ApiBody>> {
        self.gate.require(principal, permissions::SCHEDULES_READ)?;
        let schedules: Vec<ScheduleView> = self
            .scheduler
            .list()
            .into_iter()
            .map(|schedule| ScheduleView {
                next_fire: self.scheduler.next_fire(&schedule.name),
                schedule,
            })
            .collect();
        Ok(json_response(StatusCode::OK, &schedules))
    }

    fn register_schedule(&self, principal: Option<&str>, body: &Bytes) -> Result<Response<ApiBody>> {
        self.gate.require(principal, permissions::SCHEDULES_WRITE)?;
        let schedule: Schedule = parse_body(body)?;
        let name = schedule.name.clone();
        self.scheduler.register(schedule)?;
        Ok(json_response(
            StatusCode::CREATED,
            &serde_json::json!({
                "name": name,
                "next_fire": self.scheduler.next_fire(&name),
            }),
        ))
    }

    fn remove_schedule(&self, principal: Option<&str>, name: &str) -> Result<Response<ApiBody>> {
        self.gate.require(principal, permissions::SCHEDULES_WRITE)?;
        let removed = self.scheduler.remove(name)?;
        Ok(json_response(StatusCode::OK, &removed))
    }

    /// Register a new function or publish a new version of an existing one
    fn put_function(&self, principal: Option<&str>, body: &Bytes) -> Result<Response<ApiBody>> {
        self.gate.require(principal, permissions::FUNCTIONS_WRITE)?;
        let function: Function = parse_body(body)?;
        let function_ref = FunctionRef::new(&function.namespace, &function.name);

        let registry = self.runtime.registry();
        let (status, instrumented) = if registry.get(&function_ref).is_some() {
            (StatusCode::OK, registry.update(function)?)
        } else {
            (StatusCode::CREATED, registry.register(function)?)
        };

        Ok(json_response(
            status,
            &serde_json::json!({
                "function": function_ref.to_string(),
                "version": instrumented.definition.version,
                "remote_calls": instrumented
                    .remote_calls
                    .iter()
                    .map(|r| r.to_string())
                    .collect::<Vec<_>>(),
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{DependencyResolver, LocalBackend, ResourceLimits, WorkerPool};
    use crate::security::PatternGate;
    use crate::tracking::{ExecutionTracker, MemoryStore};
    use crate::utils::config::{PoolConfig, WorkerBackendKind};
    use crate::functions::FunctionRegistry;

    fn server() -> ApiServer {
        let dependencies = Arc::new(DependencyResolver::default());
        let pool = WorkerPool::new(
            PoolConfig {
                backend: WorkerBackendKind::Local,
                min_workers: 0,
                max_workers: 4,
                ready_timeout_secs: 1,
                ..PoolConfig::default()
            },
            Arc::new(LocalBackend::new(dependencies.clone())),
        );
        let runtime = Arc::new(FunctionRuntime::new(
            Arc::new(FunctionRegistry::new()),
            Arc::new(ExecutionTracker::new(Arc::new(MemoryStore::new()))),
            dependencies,
            pool,
            ResourceLimits::default(),
        ));
        let scheduler = Arc::new(Scheduler::new(runtime.clone()));

        let mut gate = PatternGate::new();
        gate.grant("admin", "fnrt.*:all").unwrap();
        gate.grant("caller", "fnrt.functions.demo.*:own").unwrap();

        ApiServer::new(runtime, scheduler, Arc::new(gate), None, 1024)
    }

    async fn call(
        server: &ApiServer,
        method: Method,
        path: &str,
        principal: Option<&str>,
        body: &str,
    ) -> (StatusCode, serde_json::Value) {
        let uri: Uri = path.parse().unwrap();
        let response = server
            .handle(&method, &uri, principal, Bytes::from(body.to_string()))
            .await;
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    fn function_body(name: &str, code: &str) -> String {
        serde_json::json!({"namespace": "demo", "name": name, "code": code}).to_string()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let server = server();
        let (status, body) = call(&server, Method::GET, "/health", None, "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_scale_requires_permission_and_range() {
        let server = server();

        let (status, _) = call(&server, Method::POST, "/workers/scale", Some("caller"), r#"{"target_count": 2}"#).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(&server, Method::POST, "/workers/scale", Some("admin"), r#"{"target_count": 9}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "out_of_range");

        let (status, body) = call(&server, Method::POST, "/workers/scale", Some("admin"), r#"{"target_count": 2}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["current"], 2);

        let (_, body) = call(&server, Method::GET, "/workers/count", Some("admin"), "").await;
        assert_eq!(body["count"], 2);

        let (_, body) = call(&server, Method::GET, "/workers", Some("admin"), "").await;
        let workers = body.as_array().unwrap();
        assert_eq!(workers.len(), 2);
        assert_eq!(workers[0]["status"], "running");
        assert!(workers[0]["container_name"].as_str().unwrap().starts_with("fnrt-"));
    }

    #[tokio::test]
    async fn test_register_then_webhook() {
        let server = server();

        let (status, body) = call(
            &server,
            Method::POST,
            "/functions",
            Some("admin"),
            &function_body("double", "fn double(input) { return input * 2; }"),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["version"], 1);

        let (status, body) = call(&server, Method::POST, "/webhooks/demo/double", Some("caller"), "21").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
        assert_eq!(body["output"], 42);

        let id = body["execution_id"].as_str().unwrap().to_string();
        let (status, detail) = call(&server, Method::GET, &format!("/executions/{}", id), Some("admin"), "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["trigger"]["kind"], "webhook");
        assert_eq!(detail["trigger"]["principal"], "caller");

        let (status, _) = call(&server, Method::GET, &format!("/executions/{}", id), Some("caller"), "").await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, listed) =
            call(&server, Method::GET, "/executions?function=demo%2Fdouble", Some("admin"), "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["execution_id"], id.as_str());
    }

    #[tokio::test]
    async fn test_function_update_bumps_version() {
        let server = server();
        let body = function_body("id", "fn id(input) { return input; }");
        call(&server, Method::POST, "/functions", Some("admin"), &body).await;
        let (status, reply) = call(&server, Method::POST, "/functions", Some("admin"), &body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["version"], 2);
    }

    #[tokio::test]
    async fn test_webhook_failures() {
        let server = server();

        let (status, _) = call(&server, Method::POST, "/webhooks/other/fn", Some("caller"), "").await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(&server, Method::POST, "/webhooks/demo/missing", Some("caller"), "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&server, Method::POST, "/functions", Some("admin"), &function_body("bad", "fn bad( {")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        call(
            &server,
            Method::POST,
            "/functions",
            Some("admin"),
            &function_body("boom", r#"fn boom(input) { raise error("ValueError", "nope"); }"#),
        )
        .await;
        let (status, body) = call(&server, Method::POST, "/webhooks/demo/boom", Some("caller"), "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "failed");
        assert_eq!(body["error"]["error_type"], "ValueError");
    }

    #[tokio::test]
    async fn test_schedules_round_trip() {
        let server = server();
        let schedule = serde_json::json!({
            "name": "tick",
            "function_name": "demo/id",
            "cron_expression": "*/5 * * * *",
        })
        .to_string();

        let (status, _) = call(&server, Method::POST, "/schedules", Some("caller"), &schedule).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(&server, Method::POST, "/schedules", Some("admin"), &schedule).await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(body["next_fire"].is_string());

        let (_, body) = call(&server, Method::GET, "/schedules", Some("admin"), "").await;
        assert_eq!(body[0]["name"], "tick");
        assert!(body[0]["enabled"].as_bool().unwrap());

        let (status, _) = call(&server, Method::DELETE, "/schedules/tick", Some("admin"), "").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&server, Method::DELETE, "/schedules/tick", Some("admin"), "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_route_and_disabled_metrics() {
        let server = server();
        let (status, _) = call(&server, Method::GET, "/nope", None, "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&server, Method::GET, "/metrics", None, "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_query_param() {
        let uri: Uri = "/executions?function=demo/id&limit=5".parse().unwrap();
        assert_eq!(query_param(&uri, "function").as_deref(), Some("demo/id"));
        assert_eq!(query_param(&uri, "limit").as_deref(), Some("5"));
        assert_eq!(query_param(&uri, "async"), None);

        let uri: Uri = "/executions?function=demo%2Fid&tag=a+b".parse().unwrap();
        assert_eq!(query_param(&uri, "function").as_deref(), Some("demo/id"));
        assert_eq!(query_param(&uri, "tag").as_deref(), Some("a b"));
    }
}
