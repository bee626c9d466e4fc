use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use cirrus_gateway::auth::ApiKeyManager;
use cirrus_gateway::config::GatewayConfig;
use cirrus_gateway::{create_app, AppState, ServerMetrics};
use cirrus_pool::{FirecrackerHypervisor, Hypervisor, PoolConfig, VmPoolManager};
use cirrus_registry::FunctionRegistry;
use cirrus_scheduler::{HttpAgentClient, ResultReconciler, Scheduler, SchedulerConfig};
use cirrus_state::StateStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    info!("Starting Cirrus control plane");

    let state_store = StateStore::connect(&config.db_path, config.redis_url.as_deref()).await?;
    let registry = Arc::new(FunctionRegistry::new(
        state_store.clone(),
        &config.function_storage_dir,
    )?);

    let pool_config = PoolConfig::from_env();
    let hypervisor: Arc<dyn Hypervisor> = Arc::new(FirecrackerHypervisor::new(
        pool_config.hypervisor_path.clone(),
    )?);
    let pool = Arc::new(VmPoolManager::new(
        state_store.clone(),
        hypervisor,
        pool_config,
    ));
    Arc::clone(&pool).spawn_refill_task();

    let scheduler = Scheduler::new(
        state_store.clone(),
        Arc::clone(&registry),
        Arc::clone(&pool),
        Arc::new(HttpAgentClient::new()),
        SchedulerConfig::default(),
    );
    let reconciler = Arc::new(ResultReconciler::new(state_store.clone()));

    let app = create_app(AppState {
        registry,
        scheduler,
        reconciler,
        pool,
        state: state_store,
        auth: Arc::new(ApiKeyManager::new()),
        metrics: Arc::new(ServerMetrics::default()),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, "Listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
