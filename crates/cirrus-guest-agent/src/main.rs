//! In-VM agent.
//!
//! Listens on the agent port for dispatches from the control plane, runs
//! each function in a scratch directory and posts the completion report back
//! to `/api/results`. Delivery is at-least-once: 5xx and transport failures
//! are retried with exponential backoff, the control plane's reconciler
//! de-duplicates.

mod runner;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cirrus_common::{DispatchPayload, ResultReport, VmHeartbeat, VmStatus, AGENT_PORT};

const RESULT_ENDPOINT: &str = "/api/results";
const REGISTER_ENDPOINT: &str = "/api/vms/register";
const MAX_DELIVERY_ATTEMPTS: u32 = 5;

#[derive(Clone)]
struct AgentState {
    client: reqwest::Client,
    control_plane_url: String,
    code_dir: PathBuf,
    vm_id: String,
    vm_ip: String,
}

impl AgentState {
    fn from_env() -> Self {
        Self {
            client: reqwest::Client::new(),
            control_plane_url: std::env::var("CIRRUS_CONTROL_PLANE_URL")
                .unwrap_or_else(|_| "http://172.16.0.1:8080".to_string()),
            code_dir: std::env::var("CIRRUS_CODE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp/cirrus/code")),
            vm_id: std::env::var("VM_ID").unwrap_or_default(),
            vm_ip: std::env::var("VM_IP").unwrap_or_default(),
        }
    }

    fn heartbeat(&self, status: VmStatus) -> VmHeartbeat {
        VmHeartbeat {
            vm_id: self.vm_id.clone(),
            ip_address: self.vm_ip.clone(),
            machine_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "cirrus-vm".to_string()),
            status,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let state = Arc::new(AgentState::from_env());
    info!(vm_id = %state.vm_id, control_plane = %state.control_plane_url, "Starting guest agent");

    if let Err(err) = tokio::fs::create_dir_all(&state.code_dir).await {
        error!(error = %err, "Failed to create code directory");
        return;
    }

    // Best-effort boot report; the control plane already has the row.
    report_status(&state, VmStatus::Ready).await;

    let app = Router::new()
        .route("/execute", post(handle_execute))
        .route("/health", get(handle_health))
        .with_state(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], AGENT_PORT));
    info!(%addr, "Listening for dispatches");
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, "Failed to bind agent port");
            return;
        }
    };
    if let Err(err) = axum::serve(listener, app).await {
        error!(error = %err, "Agent server failed");
    }
}

async fn handle_health() -> impl IntoResponse {
    StatusCode::OK
}

/// Accept the dispatch immediately; the result travels out-of-band.
async fn handle_execute(
    State(state): State<Arc<AgentState>>,
    Json(payload): Json<DispatchPayload>,
) -> impl IntoResponse {
    info!(
        request_id = %payload.request_id,
        function = %payload.name,
        "Accepted execution request"
    );

    tokio::spawn(async move {
        let report = runner::execute(&payload, &state.code_dir).await;
        deliver_result(&state, &report).await;
        report_status(&state, VmStatus::Ready).await;
    });

    (StatusCode::ACCEPTED, "execution started")
}

/// Push the report until the control plane takes it: retry transport errors
/// and 5xx with exponential backoff, give up on 4xx (the reconciler has
/// rejected it for good).
async fn deliver_result(state: &AgentState, report: &ResultReport) {
    let url = format!("{}{}", state.control_plane_url, RESULT_ENDPOINT);
    let mut backoff = Duration::from_millis(500);

    for attempt in 1..=MAX_DELIVERY_ATTEMPTS {
        match state.client.post(&url).json(report).send().await {
            Ok(response) if response.status().is_success() => {
                info!(request_id = %report.request_id, "Result delivered");
                return;
            }
            Ok(response) if response.status().is_client_error() => {
                warn!(
                    request_id = %report.request_id,
                    status = %response.status(),
                    "Control plane rejected result, not retrying"
                );
                return;
            }
            Ok(response) => {
                warn!(
                    request_id = %report.request_id,
                    status = %response.status(),
                    attempt,
                    "Result delivery failed"
                );
            }
            Err(err) => {
                warn!(request_id = %report.request_id, error = %err, attempt, "Result delivery failed");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff *= 2;
    }
    error!(request_id = %report.request_id, "Giving up on result delivery");
}

async fn report_status(state: &AgentState, status: VmStatus) {
    let url = format!("{}{}", state.control_plane_url, REGISTER_ENDPOINT);
    if let Err(err) = state
        .client
        .post(&url)
        .json(&state.heartbeat(status))
        .send()
        .await
    {
        warn!(error = %err, "Failed to report VM status");
    }
}
