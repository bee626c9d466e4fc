//! HTTP API surface for the Cirrus control plane.
//!
//! Translates requests into calls on the registry, scheduler, pool manager
//! and result reconciler. Function, execution and VM surfaces sit behind
//! API-key auth; the agent-facing callback endpoints are open.

pub mod auth;
pub mod config;


use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use cirrus_common::{Error, InvocationOutcome, ResultReport, VmHeartbeat};
use cirrus_pool::VmPoolManager;
use cirrus_registry::{FunctionRegistry, RegisterFunction};
use cirrus_scheduler::{ResultReconciler, Scheduler};
use cirrus_state::StateStore;

use crate::auth::ApiKeyManager;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<FunctionRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub reconciler: Arc<ResultReconciler>,
    pub pool: Arc<VmPoolManager>,
    pub state: StateStore,
    pub auth: Arc<ApiKeyManager>,
    pub metrics: Arc<ServerMetrics>,
}

#[derive(Debug, Default)]
pub struct ServerMetrics {
    pub invocations: AtomicU64,
    pub async_invocations: AtomicU64,
    pub results_received: AtomicU64,
    pub functions_registered: AtomicU64,
}

// --- API error mapping ---

pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::FunctionNotFound(_) | Error::ExecutionNotFound(_) | Error::UnknownVm(_) => {
                StatusCode::NOT_FOUND
            }
            Error::FunctionAlreadyExists(_) => StatusCode::CONFLICT,
            Error::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            Error::CapacityExhausted(_) | Error::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            Error::ExecutionTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(error = %self.0, "Request failed");
        }
        (status, Json(serde_json::json!({"error": self.0.to_string()}))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// --- Request bodies ---

fn default_object() -> serde_json::Value {
    serde_json::json!({})
}

#[derive(Debug, Deserialize)]
pub struct InvokeRequest {
    #[serde(default = "default_object")]
    pub input: serde_json::Value,
    #[serde(default = "default_object")]
    pub context: serde_json::Value,
    #[serde(default)]
    pub sync: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdateFunctionRequest {
    pub code: String,
    #[serde(default)]
    pub requirements: String,
    #[serde(default)]
    pub config: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiKeyRequest {
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Seconds until expiry.
    pub expires_in: u64,
}

pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/functions", post(register_function).get(list_functions))
        .route(
            "/api/functions/:id",
            get(get_function).put(update_function).delete(delete_function),
        )
        .route("/api/functions/name/:name", get(get_function_by_name))
        .route("/api/functions/:id/invoke", post(invoke_function))
        .route(
            "/api/functions/name/:name/invoke",
            post(invoke_function_by_name),
        )
        .route("/api/executions/:id", get(get_execution))
        .route("/api/executions/function/:id", get(list_executions))
        .route("/api/vms", get(list_vms))
        .route("/api/vms/:id", get(get_vm))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    Router::new()
        .merge(protected)
        .route("/api/auth/api-key", post(generate_api_key))
        // Open: VMs report here without holding keys.
        .route("/api/vms/register", post(register_vm))
        .route("/api/results", post(receive_result))
        .route("/api/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn generate_api_key(
    State(state): State<AppState>,
    Json(req): Json<ApiKeyRequest>,
) -> impl IntoResponse {
    let key = state.auth.generate(
        &req.user_id,
        req.roles,
        Duration::from_secs(req.expires_in),
    );
    Json(serde_json::json!({ "api_key": key }))
}

// --- Functions ---

async fn register_function(
    State(state): State<AppState>,
    Json(req): Json<RegisterFunction>,
) -> ApiResult<Response> {
    let metadata = state.registry.register(req).await?;
    state
        .metrics
        .functions_registered
        .fetch_add(1, Ordering::Relaxed);
    Ok((StatusCode::OK, Json(metadata)).into_response())
}

async fn list_functions(State(state): State<AppState>) -> ApiResult<Response> {
    let functions = state.registry.list().await?;
    Ok(Json(functions).into_response())
}

async fn get_function(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let metadata = state.registry.get_metadata(&id).await?;
    Ok(Json(metadata).into_response())
}

async fn get_function_by_name(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let metadata = state.registry.get_metadata_by_name(&name).await?;
    Ok(Json(metadata).into_response())
}

async fn update_function(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateFunctionRequest>,
) -> ApiResult<Response> {
    let metadata = state
        .registry
        .update(&id, req.code, req.requirements, req.config)
        .await?;
    Ok(Json(metadata).into_response())
}

async fn delete_function(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    state.registry.delete(&id).await?;
    Ok(Json(serde_json::json!({"status": "deleted", "id": id})).into_response())
}

// --- Invocation ---

/// HTTP status for a scheduling outcome: the body's wire status carries the
/// detail, the HTTP layer mirrors the terminal classes.
fn invocation_status(outcome: &InvocationOutcome) -> StatusCode {
    match outcome.status_code {
        202 => StatusCode::ACCEPTED,
        500 => StatusCode::INTERNAL_SERVER_ERROR,
        504 => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::OK,
    }
}

async fn invoke_function(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<InvokeRequest>,
) -> ApiResult<Response> {
    count_invocation(&state, req.sync);
    let outcome = state
        .scheduler
        .schedule(&id, req.input, req.context, req.sync)
        .await?;
    Ok((invocation_status(&outcome), Json(outcome)).into_response())
}

async fn invoke_function_by_name(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<InvokeRequest>,
) -> ApiResult<Response> {
    count_invocation(&state, req.sync);
    let outcome = state
        .scheduler
        .schedule_by_name(&name, req.input, req.context, req.sync)
        .await?;
    Ok((invocation_status(&outcome), Json(outcome)).into_response())
}

fn count_invocation(state: &AppState, sync: bool) {
    state.metrics.invocations.fetch_add(1, Ordering::Relaxed);
    if !sync {
        state.metrics.async_invocations.fetch_add(1, Ordering::Relaxed);
    }
}

// --- Executions ---

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let Some(execution) = state.state.get_execution(&id).await? else {
        return Err(Error::ExecutionNotFound(id).into());
    };
    Ok(Json(execution).into_response())
}

async fn list_executions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let executions = state.state.list_executions_for_function(&id).await?;
    Ok(Json(executions).into_response())
}

// --- VMs ---

async fn list_vms(State(state): State<AppState>) -> ApiResult<Response> {
    let vms = state.pool.list().await?;
    Ok(Json(vms).into_response())
}

async fn get_vm(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    let Some(vm) = state.pool.get(&id).await? else {
        return Err(Error::UnknownVm(id).into());
    };
    Ok(Json(vm).into_response())
}

async fn register_vm(
    State(state): State<AppState>,
    Json(heartbeat): Json<VmHeartbeat>,
) -> ApiResult<Response> {
    info!(
        vm_id = %heartbeat.vm_id,
        machine = %heartbeat.machine_name,
        status = %heartbeat.status,
        "VM status report"
    );

    let Some(mut vm) = state.state.get_vm(&heartbeat.vm_id).await? else {
        return Err(Error::UnknownVm(heartbeat.vm_id).into());
    };
    vm.status = heartbeat.status.as_str().to_string();
    vm.ip = heartbeat.ip_address;
    state.state.save_vm(&vm).await?;
    Ok(Json(serde_json::json!({"status": "registered"})).into_response())
}

// --- Result callback ---

async fn receive_result(
    State(state): State<AppState>,
    Json(report): Json<ResultReport>,
) -> ApiResult<Response> {
    state
        .metrics
        .results_received
        .fetch_add(1, Ordering::Relaxed);
    state.reconciler.receive_result(&report).await?;
    Ok(Json(serde_json::json!({"status": "received"})).into_response())
}

// --- Metrics ---

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = &state.metrics;
    Json(serde_json::json!({
        "invocations": metrics.invocations.load(Ordering::Relaxed),
        "async_invocations": metrics.async_invocations.load(Ordering::Relaxed),
        "results_received": metrics.results_received.load(Ordering::Relaxed),
        "functions_registered": metrics.functions_registered.load(Ordering::Relaxed),
        "warm_pool_size": state.pool.pool_size().await,
    }))
}
