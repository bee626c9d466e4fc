//! Invocation scheduling.
//!
//! The scheduler turns invocation requests into completed execution records:
//! it resolves the function, persists a `pending` row, leases a VM, pushes
//! the payload to the in-VM agent and waits for the result reconciler to
//! write the terminal state. Asynchronous requests go through a bounded work
//! queue drained by a fixed pool of workers running the same path. A
//! periodic monitor reaps executions whose agent never reported back.

mod dispatch;
mod reconciler;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use cirrus_common::{
    DispatchPayload, Error, ExecutionStatus, FunctionMetadata, InvocationOutcome, Result,
    DEFAULT_ENTRY_POINT,
};
use cirrus_pool::VmPoolManager;
use cirrus_registry::FunctionRegistry;
use cirrus_state::{ExecutionRecord, StateStore};

pub use crate::dispatch::{AgentClient, HttpAgentClient};
pub use crate::reconciler::ResultReconciler;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Bounded queue for asynchronous invocations.
    pub queue_capacity: usize,
    /// Workers draining that queue.
    pub worker_count: usize,
    /// Sync-rendezvous polling cadence against the store.
    pub poll_interval: Duration,
    /// Polls before the sync path gives up on a result.
    pub poll_retries: u32,
    /// Added to the function timeout for the dispatch HTTP call.
    pub dispatch_buffer: Duration,
    /// Age past which the monitor declares an active execution stalled.
    pub stall_threshold: Duration,
    /// Monitor scan cadence.
    pub monitor_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            worker_count: 5,
            poll_interval: Duration::from_millis(500),
            poll_retries: 30,
            dispatch_buffer: Duration::from_secs(5),
            stall_threshold: Duration::from_secs(300),
            monitor_interval: Duration::from_secs(10),
        }
    }
}

/// One unit of work: an invocation bound to a fresh execution id.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub request_id: String,
    pub function_id: String,
    pub event: serde_json::Value,
    pub context: serde_json::Value,
}

pub struct Scheduler {
    state: StateStore,
    registry: Arc<FunctionRegistry>,
    pool: Arc<VmPoolManager>,
    agent: Arc<dyn AgentClient>,
    config: SchedulerConfig,
    queue_tx: mpsc::Sender<ExecutionRequest>,
}

impl Scheduler {
    /// Build the scheduler and start its worker pool and timeout monitor.
    pub fn new(
        state: StateStore,
        registry: Arc<FunctionRegistry>,
        pool: Arc<VmPoolManager>,
        agent: Arc<dyn AgentClient>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
        let scheduler = Arc::new(Self {
            state,
            registry,
            pool,
            agent,
            config,
            queue_tx,
        });

        // Workers share one receiver; the channel hands each item to exactly
        // one of them.
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        for worker_id in 0..scheduler.config.worker_count {
            tokio::spawn(run_worker(Arc::clone(&scheduler), Arc::clone(&queue_rx), worker_id));
        }
        tokio::spawn(run_monitor(Arc::clone(&scheduler)));

        scheduler
    }

    /// Invoke a function by id.
    #[instrument(skip(self, event, context))]
    pub async fn schedule(
        &self,
        function_id: &str,
        event: serde_json::Value,
        context: serde_json::Value,
        sync: bool,
    ) -> Result<InvocationOutcome> {
        // Fail fast before creating any state.
        let metadata = self.registry.get_metadata(function_id).await?;
        self.submit(metadata, event, context, sync).await
    }

    /// Invoke a function by its unique name.
    #[instrument(skip(self, event, context))]
    pub async fn schedule_by_name(
        &self,
        function_name: &str,
        event: serde_json::Value,
        context: serde_json::Value,
        sync: bool,
    ) -> Result<InvocationOutcome> {
        let metadata = self.registry.get_metadata_by_name(function_name).await?;
        self.submit(metadata, event, context, sync).await
    }

    async fn submit(
        &self,
        metadata: FunctionMetadata,
        event: serde_json::Value,
        context: serde_json::Value,
        sync: bool,
    ) -> Result<InvocationOutcome> {
        let request = ExecutionRequest {
            request_id: Uuid::new_v4().to_string(),
            function_id: metadata.id.clone(),
            event,
            context,
        };

        if sync {
            return self.execute(request).await;
        }

        let accepted =
            InvocationOutcome::accepted(request.request_id.clone(), request.function_id.clone());
        match self.queue_tx.try_send(request) {
            Ok(()) => Ok(accepted),
            Err(mpsc::error::TrySendError::Full(_)) => Err(Error::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(Error::Internal("work queue closed".to_string()))
            }
        }
    }

    /// Current view of an execution: 102-style `processing` while active,
    /// otherwise whatever terminal state the store holds.
    pub async fn get_result(&self, execution_id: &str) -> Result<InvocationOutcome> {
        if self.state.is_execution_active(execution_id) {
            let function_id = self
                .state
                .get_execution(execution_id)
                .await?
                .map(|e| e.function_id)
                .unwrap_or_default();
            return Ok(InvocationOutcome::processing(
                execution_id.to_string(),
                function_id,
            ));
        }

        let Some(execution) = self.state.get_execution(execution_id).await? else {
            return Err(Error::ExecutionNotFound(execution_id.to_string()));
        };
        Ok(outcome_from_record(&execution))
    }

    /// The synchronous path: resolve, persist, lease, dispatch, wait for the
    /// reconciler's terminal write, release. Also run by the async workers,
    /// which discard the returned outcome.
    async fn execute(&self, request: ExecutionRequest) -> Result<InvocationOutcome> {
        let metadata = self.registry.get_metadata(&request.function_id).await?;
        let code = self.registry.get_code(&request.function_id).await?;

        self.state
            .insert_execution(&ExecutionRecord {
                id: request.request_id.clone(),
                function_id: request.function_id.clone(),
                vm_id: None,
                status: ExecutionStatus::Pending.as_str().to_string(),
                start_time: Utc::now(),
                end_time: None,
                duration_ms: None,
                output: None,
                error: None,
            })
            .await?;

        let vm = match self.pool.lease().await {
            Ok(vm) => vm,
            Err(err) => {
                let reason = format!("Failed to allocate VM: {err}");
                self.state
                    .finalize_execution(
                        &request.request_id,
                        ExecutionStatus::Failed,
                        None,
                        Some(&reason),
                    )
                    .await?;
                return Err(err);
            }
        };

        if let Err(err) = self
            .state
            .mark_execution_running(&request.request_id, &vm.id)
            .await
        {
            // Don't strand the lease on a storage failure.
            if let Err(release_err) = self.pool.release(&vm.id).await {
                error!(error = %release_err, vm_id = %vm.id, "Failed to return VM to pool");
            }
            return Err(err);
        }
        self.state.track_execution(&request.request_id, &vm.id);

        let payload = DispatchPayload {
            function_id: metadata.id.clone(),
            name: metadata.name.clone(),
            code: code.code,
            requirements: code.requirements,
            config: code.config,
            runtime: metadata.runtime.clone(),
            entry_point: DEFAULT_ENTRY_POINT.to_string(),
            environment: HashMap::new(),
            request_id: request.request_id.clone(),
            timeout: metadata.timeout,
            memory: metadata.memory,
            version: metadata.version.clone(),
            event: request.event.clone(),
            context: request.context.clone(),
        };
        let dispatch_timeout =
            Duration::from_secs(metadata.timeout) + self.config.dispatch_buffer;

        if let Err(err) = self
            .agent
            .dispatch(&vm.ip, &payload, dispatch_timeout)
            .await
        {
            // A VM that would not take a dispatch is not worth pooling.
            warn!(error = %err, vm_id = %vm.id, "Dispatch failed, quarantining VM");
            let reason = err.to_string();
            self.state
                .finalize_execution(
                    &request.request_id,
                    ExecutionStatus::Failed,
                    None,
                    Some(&reason),
                )
                .await?;
            self.state.untrack_execution(&request.request_id);
            if let Err(term_err) = self.pool.terminate(&vm.id).await {
                error!(error = %term_err, vm_id = %vm.id, "Failed to terminate quarantined VM");
            }
            return Err(err);
        }

        // Sync rendezvous: the reconciler writes the terminal state, we
        // observe it through the store.
        for _ in 0..self.config.poll_retries {
            tokio::time::sleep(self.config.poll_interval).await;

            let Some(execution) = self.state.get_execution(&request.request_id).await? else {
                continue;
            };
            let status: ExecutionStatus = execution.status.parse()?;
            if status.is_terminal() {
                self.state.untrack_execution(&request.request_id);
                if let Err(err) = self.pool.release(&vm.id).await {
                    error!(error = %err, vm_id = %vm.id, "Failed to return VM to pool");
                }
                return Ok(outcome_from_record(&execution));
            }
        }

        warn!(request_id = %request.request_id, "Gave up waiting for result");
        let timed_out = self
            .state
            .finalize_execution(
                &request.request_id,
                ExecutionStatus::Timeout,
                None,
                Some("Execution timed out waiting for result"),
            )
            .await?;
        self.state.untrack_execution(&request.request_id);

        if timed_out {
            // The agent went quiet mid-execution; treat the VM as wedged.
            if let Err(err) = self.pool.terminate(&vm.id).await {
                error!(error = %err, vm_id = %vm.id, "Failed to terminate wedged VM");
            }
        } else if let Err(err) = self.pool.release(&vm.id).await {
            // A result landed between the last poll and the timeout write.
            error!(error = %err, vm_id = %vm.id, "Failed to return VM to pool");
        }

        let execution = self
            .state
            .get_execution(&request.request_id)
            .await?
            .ok_or_else(|| Error::ExecutionNotFound(request.request_id.clone()))?;
        Ok(outcome_from_record(&execution))
    }

    /// One monitor sweep: finalize anything active for longer than the stall
    /// threshold and free its VM.
    pub async fn reap_stalled_executions(&self) {
        let stall = match chrono::Duration::from_std(self.config.stall_threshold) {
            Ok(stall) => stall,
            Err(_) => return,
        };
        let now = Utc::now();

        for (execution_id, active) in self.state.active_executions() {
            if now - active.started_at <= stall {
                continue;
            }
            warn!(%execution_id, vm_id = %active.vm_id, "Execution stalled, marking timed out");

            match self
                .state
                .finalize_execution(
                    &execution_id,
                    ExecutionStatus::Timeout,
                    None,
                    Some("Execution timed out"),
                )
                .await
            {
                Ok(true) => {
                    if let Err(err) = self.pool.release(&active.vm_id).await {
                        error!(error = %err, vm_id = %active.vm_id, "Failed to release VM of stalled execution");
                    }
                }
                Ok(false) => {
                    info!(%execution_id, "Execution finalised concurrently, monitor is a no-op")
                }
                Err(err) => {
                    error!(error = %err, %execution_id, "Failed to finalise stalled execution");
                    continue;
                }
            }
            self.state.untrack_execution(&execution_id);
        }
    }
}

async fn run_worker(
    scheduler: Arc<Scheduler>,
    queue_rx: Arc<Mutex<mpsc::Receiver<ExecutionRequest>>>,
    worker_id: usize,
) {
    loop {
        let request = { queue_rx.lock().await.recv().await };
        let Some(request) = request else {
            break;
        };
        info!(
            worker_id,
            request_id = %request.request_id,
            function_id = %request.function_id,
            "Processing async invocation"
        );
        if let Err(err) = scheduler.execute(request).await {
            error!(worker_id, error = %err, "Async invocation failed");
        }
    }
}

async fn run_monitor(scheduler: Arc<Scheduler>) {
    let mut tick = tokio::time::interval(scheduler.config.monitor_interval);
    // The immediate first tick would reap nothing; skip straight to cadence.
    tick.tick().await;
    loop {
        tick.tick().await;
        scheduler.reap_stalled_executions().await;
    }
}

fn outcome_from_record(execution: &ExecutionRecord) -> InvocationOutcome {
    let status_code = match execution.status.as_str() {
        "completed" => 200,
        "failed" => 500,
        "timeout" => 504,
        _ => 102,
    };
    InvocationOutcome {
        request_id: execution.id.clone(),
        function_id: execution.function_id.clone(),
        status_code,
        output: execution
            .output
            .as_deref()
            .map(|o| serde_json::from_str(o).unwrap_or(serde_json::Value::String(o.to_string()))),
        error_message: execution.error.clone(),
        duration_ms: execution.duration_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use cirrus_common::ResultReport;
    use cirrus_pool::{Hypervisor, LaunchSpec, PoolConfig, VmHandle};
    use cirrus_registry::RegisterFunction;

    struct StubHypervisor {
        fail_launch: bool,
    }

    #[async_trait]
    impl Hypervisor for StubHypervisor {
        async fn launch(&self, spec: &LaunchSpec) -> Result<VmHandle> {
            if self.fail_launch {
                return Err(Error::VmCreateFailed("stub launch failure".to_string()));
            }
            Ok(VmHandle::detached(spec.vm_dir.join("firecracker.sock")))
        }

        async fn shutdown(&self, _handle: &mut VmHandle) -> Result<()> {
            Ok(())
        }
    }

    /// Plays the agent and its callback in one step: accepts the dispatch
    /// and immediately reports a result through the reconciler.
    struct EchoAgent {
        reconciler: ResultReconciler,
        status_code: u16,
        dispatches: AtomicUsize,
    }

    #[async_trait]
    impl AgentClient for EchoAgent {
        async fn dispatch(
            &self,
            _vm_ip: &str,
            payload: &DispatchPayload,
            _timeout: Duration,
        ) -> Result<()> {
            self.dispatches.fetch_add(1, Ordering::SeqCst);
            let output = serde_json::json!({
                "hi": payload.event.get("name").and_then(|v| v.as_str()).unwrap_or("world")
            });
            self.reconciler
                .receive_result(&ResultReport {
                    request_id: payload.request_id.clone(),
                    function_id: payload.function_id.clone(),
                    status_code: self.status_code,
                    output: output.to_string(),
                    error_message: (self.status_code != 200).then(|| "handler raised".to_string()),
                    duration_ms: 5,
                    memory_usage_kb: None,
                })
                .await?;
            Ok(())
        }
    }

    /// Accepts the dispatch and never reports back.
    struct SilentAgent;

    #[async_trait]
    impl AgentClient for SilentAgent {
        async fn dispatch(
            &self,
            _vm_ip: &str,
            _payload: &DispatchPayload,
            _timeout: Duration,
        ) -> Result<()> {
            Ok(())
        }
    }

    struct UnreachableAgent;

    #[async_trait]
    impl AgentClient for UnreachableAgent {
        async fn dispatch(
            &self,
            _vm_ip: &str,
            _payload: &DispatchPayload,
            _timeout: Duration,
        ) -> Result<()> {
            Err(Error::DispatchFailed("connection refused".to_string()))
        }
    }

    struct Fixture {
        state: StateStore,
        registry: Arc<FunctionRegistry>,
        pool: Arc<VmPoolManager>,
        scheduler: Arc<Scheduler>,
        _tmp: tempfile::TempDir,
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_millis(10),
            poll_retries: 20,
            ..SchedulerConfig::default()
        }
    }

    async fn fixture_with(
        agent: impl FnOnce(ResultReconciler) -> Arc<dyn AgentClient>,
        config: SchedulerConfig,
        fail_launch: bool,
    ) -> Fixture {
        let state = StateStore::connect_in_memory().await.unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(
            FunctionRegistry::new(state.clone(), tmp.path().join("functions")).unwrap(),
        );
        let pool = Arc::new(VmPoolManager::new(
            state.clone(),
            Arc::new(StubHypervisor { fail_launch }),
            PoolConfig {
                warm_pool_size: 2,
                base_dir: PathBuf::from(tmp.path().join("vms")),
                ..PoolConfig::default()
            },
        ));
        let agent = agent(ResultReconciler::new(state.clone()));
        let scheduler = Scheduler::new(
            state.clone(),
            Arc::clone(&registry),
            Arc::clone(&pool),
            agent,
            config,
        );
        Fixture {
            state,
            registry,
            pool,
            scheduler,
            _tmp: tmp,
        }
    }

    fn echo_agent(status_code: u16) -> impl FnOnce(ResultReconciler) -> Arc<dyn AgentClient> {
        move |reconciler| {
            Arc::new(EchoAgent {
                reconciler,
                status_code,
                dispatches: AtomicUsize::new(0),
            })
        }
    }

    async fn register_greet(registry: &FunctionRegistry) -> FunctionMetadata {
        registry
            .register(RegisterFunction {
                name: "greet".to_string(),
                runtime: "python3.9".to_string(),
                memory: 128,
                timeout: 30,
                code: "def handler(event, context):\n    return {\"hi\": event.get(\"name\", \"world\")}\n"
                    .to_string(),
                requirements: String::new(),
                config: String::new(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_sync_invocation_completes() {
        let fx = fixture_with(echo_agent(200), fast_config(), false).await;
        let meta = register_greet(&fx.registry).await;

        let outcome = fx
            .scheduler
            .schedule(
                &meta.id,
                serde_json::json!({"name": "Ada"}),
                serde_json::json!({}),
                true,
            )
            .await
            .unwrap();

        assert_eq!(outcome.status_code, 200);
        assert_eq!(outcome.output.unwrap()["hi"], "Ada");
        assert!(outcome.duration_ms.unwrap() >= 0);

        let row = fx
            .state
            .get_execution(&outcome.request_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, "completed");
        assert!(row.vm_id.is_some());

        // VM back in the pool, index clean.
        assert_eq!(fx.pool.pool_size().await, 1);
        assert!(!fx.state.is_execution_active(&outcome.request_id));
    }

    #[tokio::test]
    async fn test_sync_invocation_handler_failure() {
        let fx = fixture_with(echo_agent(500), fast_config(), false).await;
        let meta = register_greet(&fx.registry).await;

        let outcome = fx
            .scheduler
            .schedule(&meta.id, serde_json::json!({}), serde_json::json!({}), true)
            .await
            .unwrap();

        assert_eq!(outcome.status_code, 500);
        assert_eq!(outcome.error_message.as_deref(), Some("handler raised"));

        // Handler failures release the VM normally.
        assert_eq!(fx.pool.pool_size().await, 1);
    }

    #[tokio::test]
    async fn test_schedule_unknown_function() {
        let fx = fixture_with(echo_agent(200), fast_config(), false).await;
        let err = fx
            .scheduler
            .schedule("missing", serde_json::json!({}), serde_json::json!({}), true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FunctionNotFound(_)));

        let err = fx
            .scheduler
            .schedule_by_name("missing", serde_json::json!({}), serde_json::json!({}), true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FunctionNotFound(_)));
    }

    #[tokio::test]
    async fn test_lease_failure_marks_execution_failed() {
        let fx = fixture_with(echo_agent(200), fast_config(), true).await;
        let meta = register_greet(&fx.registry).await;

        let err = fx
            .scheduler
            .schedule(&meta.id, serde_json::json!({}), serde_json::json!({}), true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CapacityExhausted(_)));

        let rows = fx
            .state
            .list_executions_for_function(&meta.id)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "failed");
        assert!(rows[0].error.as_deref().unwrap().contains("allocate VM"));
    }

    #[tokio::test]
    async fn test_dispatch_failure_quarantines_vm() {
        let fx = fixture_with(|_| Arc::new(UnreachableAgent), fast_config(), false).await;
        let meta = register_greet(&fx.registry).await;

        let err = fx
            .scheduler
            .schedule(&meta.id, serde_json::json!({}), serde_json::json!({}), true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DispatchFailed(_)));

        let rows = fx
            .state
            .list_executions_for_function(&meta.id)
            .await
            .unwrap();
        assert_eq!(rows[0].status, "failed");

        // Quarantined, not pooled: no VM survives.
        assert_eq!(fx.pool.pool_size().await, 0);
        assert!(fx.pool.list().await.unwrap().is_empty());
        assert!(!fx.state.is_execution_active(&rows[0].id));
    }

    #[tokio::test]
    async fn test_poll_exhaustion_times_out_and_terminates_vm() {
        let config = SchedulerConfig {
            poll_interval: Duration::from_millis(5),
            poll_retries: 3,
            ..SchedulerConfig::default()
        };
        let fx = fixture_with(|_| Arc::new(SilentAgent), config, false).await;
        let meta = register_greet(&fx.registry).await;

        let outcome = fx
            .scheduler
            .schedule(&meta.id, serde_json::json!({}), serde_json::json!({}), true)
            .await
            .unwrap();

        assert_eq!(outcome.status_code, 504);
        let row = fx
            .state
            .get_execution(&outcome.request_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, "timeout");

        // The wedged VM is gone and the index is clean.
        assert!(fx.pool.list().await.unwrap().is_empty());
        assert!(!fx.state.is_execution_active(&outcome.request_id));
    }

    #[tokio::test]
    async fn test_async_invocation_reaches_same_terminal_state() {
        let fx = fixture_with(echo_agent(200), fast_config(), false).await;
        let meta = register_greet(&fx.registry).await;

        let accepted = fx
            .scheduler
            .schedule(
                &meta.id,
                serde_json::json!({"name": "Ada"}),
                serde_json::json!({}),
                false,
            )
            .await
            .unwrap();
        assert_eq!(accepted.status_code, 202);

        // Wait for a worker to drive it to a terminal state.
        let mut row = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let current = fx
                .state
                .get_execution(&accepted.request_id)
                .await
                .unwrap()
                .unwrap();
            if current.status == "completed" {
                row = Some(current);
                break;
            }
        }
        let row = row.expect("async invocation never completed");
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(row.output.as_deref().unwrap()).unwrap()
                ["hi"],
            "Ada"
        );

        let result = fx.scheduler.get_result(&accepted.request_id).await.unwrap();
        assert_eq!(result.status_code, 200);
        assert_eq!(result.output.unwrap()["hi"], "Ada");
    }

    #[tokio::test]
    async fn test_concurrent_sync_invocations_share_a_small_pool() {
        let fx = fixture_with(echo_agent(200), fast_config(), false).await;
        let meta = register_greet(&fx.registry).await;

        let (first, second) = tokio::join!(
            fx.scheduler
                .schedule(&meta.id, serde_json::json!({}), serde_json::json!({}), true),
            fx.scheduler
                .schedule(&meta.id, serde_json::json!({}), serde_json::json!({}), true),
        );

        assert_eq!(first.unwrap().status_code, 200);
        assert_eq!(second.unwrap().status_code, 200);

        // Every leased VM made it back; no VM serves two executions at once.
        for vm in fx.pool.list().await.unwrap() {
            assert_eq!(vm.status, "ready");
        }
    }

    #[tokio::test]
    async fn test_queue_full() {
        let config = SchedulerConfig {
            queue_capacity: 1,
            worker_count: 0,
            ..fast_config()
        };
        let fx = fixture_with(echo_agent(200), config, false).await;
        let meta = register_greet(&fx.registry).await;

        let first = fx
            .scheduler
            .schedule(&meta.id, serde_json::json!({}), serde_json::json!({}), false)
            .await
            .unwrap();
        assert_eq!(first.status_code, 202);

        let err = fx
            .scheduler
            .schedule(&meta.id, serde_json::json!({}), serde_json::json!({}), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueueFull));
    }

    #[tokio::test]
    async fn test_get_result_states() {
        let fx = fixture_with(echo_agent(200), fast_config(), false).await;

        // Unknown id.
        let err = fx.scheduler.get_result("ghost").await.unwrap_err();
        assert!(matches!(err, Error::ExecutionNotFound(_)));

        // Active execution reports processing.
        fx.state
            .insert_execution(&ExecutionRecord {
                id: "e-active".to_string(),
                function_id: "f1".to_string(),
                vm_id: Some("vm-1".to_string()),
                status: "running".to_string(),
                start_time: Utc::now(),
                end_time: None,
                duration_ms: None,
                output: None,
                error: None,
            })
            .await
            .unwrap();
        fx.state.track_execution("e-active", "vm-1");
        let processing = fx.scheduler.get_result("e-active").await.unwrap();
        assert_eq!(processing.status_code, 102);
    }

    #[tokio::test]
    async fn test_monitor_reaps_stalled_execution() {
        let config = SchedulerConfig {
            stall_threshold: Duration::ZERO,
            ..fast_config()
        };
        let fx = fixture_with(|_| Arc::new(SilentAgent), config, false).await;

        let vm = fx.pool.lease().await.unwrap();
        fx.state
            .insert_execution(&ExecutionRecord {
                id: "e-stalled".to_string(),
                function_id: "f1".to_string(),
                vm_id: Some(vm.id.clone()),
                status: "running".to_string(),
                start_time: Utc::now(),
                end_time: None,
                duration_ms: None,
                output: None,
                error: None,
            })
            .await
            .unwrap();
        fx.state.track_execution("e-stalled", &vm.id);

        tokio::time::sleep(Duration::from_millis(5)).await;
        fx.scheduler.reap_stalled_executions().await;

        let row = fx.state.get_execution("e-stalled").await.unwrap().unwrap();
        assert_eq!(row.status, "timeout");
        assert!(!fx.state.is_execution_active("e-stalled"));
        // The VM went back to the pool.
        assert_eq!(fx.pool.pool_size().await, 1);
    }

    #[tokio::test]
    async fn test_monitor_loses_to_reconciler() {
        let config = SchedulerConfig {
            stall_threshold: Duration::ZERO,
            ..fast_config()
        };
        let fx = fixture_with(|_| Arc::new(SilentAgent), config, false).await;
        let reconciler = ResultReconciler::new(fx.state.clone());

        fx.state
            .insert_execution(&ExecutionRecord {
                id: "e-race".to_string(),
                function_id: "f1".to_string(),
                vm_id: Some("vm-1".to_string()),
                status: "running".to_string(),
                start_time: Utc::now(),
                end_time: None,
                duration_ms: None,
                output: None,
                error: None,
            })
            .await
            .unwrap();
        fx.state.track_execution("e-race", "vm-1");

        // Callback lands first; the monitor sweep must be a no-op.
        reconciler
            .receive_result(&ResultReport {
                request_id: "e-race".to_string(),
                function_id: "f1".to_string(),
                status_code: 200,
                output: r#"{"ok":true}"#.to_string(),
                error_message: None,
                duration_ms: 3,
                memory_usage_kb: None,
            })
            .await
            .unwrap();
        fx.scheduler.reap_stalled_executions().await;

        let row = fx.state.get_execution("e-race").await.unwrap().unwrap();
        assert_eq!(row.status, "completed");
        assert_eq!(row.output.as_deref(), Some(r#"{"ok":true}"#));
    }
}
