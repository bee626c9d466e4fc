//! Micro-VM pool management.
//!
//! `VmPoolManager` owns every live hypervisor process and hands VMs to the
//! scheduler through a `lease` / `release` interface. A bounded FIFO of
//! pre-booted VMs absorbs boot latency; a background task keeps it topped up
//! to the configured size.

pub mod config;
pub mod hypervisor;
mod ip;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tracing::{error, info, warn};
use uuid::Uuid;

use cirrus_common::{Error, Result, VmStatus};
use cirrus_state::{StateStore, VmRecord};

pub use crate::config::PoolConfig;
pub use crate::hypervisor::{FirecrackerHypervisor, Hypervisor, LaunchSpec, VmHandle};
use crate::ip::IpAllocator;

pub struct VmPoolManager {
    state: StateStore,
    hypervisor: Arc<dyn Hypervisor>,
    config: PoolConfig,
    /// Warm pool. Every entry is `ready` and referenced by no execution.
    pool: Mutex<VecDeque<VmRecord>>,
    /// Live hypervisor handles, keyed by VM id.
    handles: Mutex<HashMap<String, VmHandle>>,
    ips: Mutex<IpAllocator>,
    /// Woken when a release had to terminate, so the refiller reacts before
    /// its next tick.
    refill_nudge: Notify,
}

impl VmPoolManager {
    pub fn new(state: StateStore, hypervisor: Arc<dyn Hypervisor>, config: PoolConfig) -> Self {
        let ips = IpAllocator::new(config.subnet);
        Self {
            state,
            hypervisor,
            config,
            pool: Mutex::new(VecDeque::new()),
            handles: Mutex::new(HashMap::new()),
            ips: Mutex::new(ips),
            refill_nudge: Notify::new(),
        }
    }

    /// Take a VM for an invocation: pop the warm pool, or boot one on the
    /// spot. The returned record is `busy` and persisted as such.
    pub async fn lease(&self) -> Result<VmRecord> {
        let warm = self.pool.lock().await.pop_front();
        match warm {
            Some(mut vm) => {
                info!(vm_id = %vm.id, "Leasing warm VM from pool");
                vm.status = VmStatus::Busy.as_str().to_string();
                vm.last_used = Utc::now();
                if let Err(err) = self.state.save_vm(&vm).await {
                    warn!(error = %err, vm_id = %vm.id, "Failed to persist VM lease");
                }
                Ok(vm)
            }
            None => {
                info!("Warm pool empty, creating VM for lease");
                self.create_vm(false)
                    .await
                    .map_err(|err| Error::CapacityExhausted(err.to_string()))
            }
        }
    }

    /// Hand a VM back after an invocation. It re-enters the pool `ready`,
    /// unless the pool is full, in which case it is terminated and the
    /// refiller nudged.
    pub async fn release(&self, vm_id: &str) -> Result<()> {
        let Some(mut vm) = self.state.get_vm(vm_id).await? else {
            return Err(Error::UnknownVm(vm_id.to_string()));
        };

        vm.status = VmStatus::Ready.as_str().to_string();
        vm.last_used = Utc::now();
        vm.is_warm = true;
        self.state.save_vm(&vm).await?;

        let mut pool = self.pool.lock().await;
        if pool.len() < self.config.warm_pool_size {
            info!(%vm_id, "Returned VM to warm pool");
            pool.push_back(vm);
            return Ok(());
        }
        drop(pool);

        warn!(%vm_id, "Warm pool full, terminating returned VM");
        self.terminate(vm_id).await?;
        self.refill_nudge.notify_one();
        Ok(())
    }

    /// Force a VM down and forget it everywhere: hypervisor process, warm
    /// pool, address allocation, working directory, persisted row.
    /// Idempotent.
    pub async fn terminate(&self, vm_id: &str) -> Result<()> {
        if let Some(mut handle) = self.handles.lock().await.remove(vm_id) {
            if let Err(err) = self.hypervisor.shutdown(&mut handle).await {
                error!(error = %err, %vm_id, "Hypervisor shutdown failed");
            }
        }

        self.pool.lock().await.retain(|vm| vm.id != vm_id);

        if let Some(vm) = self.state.get_vm(vm_id).await? {
            if let Ok(ip) = vm.ip.parse() {
                self.ips.lock().await.release(ip);
            }
            self.state.delete_vm(vm_id).await?;
        }

        let vm_dir = self.config.base_dir.join(vm_id);
        if let Err(err) = tokio::fs::remove_dir_all(&vm_dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %err, %vm_id, "Failed to remove VM directory");
            }
        }

        info!(%vm_id, "Terminated VM");
        Ok(())
    }

    pub async fn get(&self, vm_id: &str) -> Result<Option<VmRecord>> {
        self.state.get_vm(vm_id).await
    }

    pub async fn list(&self) -> Result<Vec<VmRecord>> {
        self.state.list_vms().await
    }

    pub async fn pool_size(&self) -> usize {
        self.pool.lock().await.len()
    }

    /// Periodic warm-pool top-up. One VM per iteration; also reacts to
    /// release-side terminations via the nudge.
    pub fn spawn_refill_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(manager.config.refill_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = manager.refill_nudge.notified() => {}
                }
                manager.refill_once().await;
            }
        })
    }

    /// Create one warm VM if the pool is below target. A concurrent refill
    /// can win the last slot, in which case the fresh VM is terminated.
    pub async fn refill_once(&self) {
        let current = self.pool.lock().await.len();
        if current >= self.config.warm_pool_size {
            return;
        }
        info!(
            current,
            target = self.config.warm_pool_size,
            "Warm pool below target, creating warm VM"
        );

        let vm = match self.create_vm(true).await {
            Ok(vm) => vm,
            Err(err) => {
                error!(error = %err, "Failed to create warm VM");
                return;
            }
        };

        let mut pool = self.pool.lock().await;
        if pool.len() < self.config.warm_pool_size {
            info!(vm_id = %vm.id, "Added VM to warm pool");
            pool.push_back(vm);
        } else {
            drop(pool);
            warn!(vm_id = %vm.id, "Warm pool filled concurrently, terminating fresh VM");
            if let Err(err) = self.terminate(&vm.id).await {
                error!(error = %err, "Failed to terminate surplus VM");
            }
        }
    }

    /// Boot pipeline: working directory, guest address, hypervisor launch,
    /// boot probe, persisted row. Any failure unwinds everything already
    /// allocated.
    async fn create_vm(&self, warm: bool) -> Result<VmRecord> {
        let vm_id = Uuid::new_v4().to_string();
        let vm_dir = self.config.base_dir.join(&vm_id);
        tokio::fs::create_dir_all(&vm_dir)
            .await
            .map_err(|e| Error::VmCreateFailed(format!("failed to create VM directory: {e}")))?;

        let Some(ip) = self.ips.lock().await.allocate() else {
            let _ = tokio::fs::remove_dir_all(&vm_dir).await;
            return Err(Error::VmCreateFailed(
                "guest address space exhausted".to_string(),
            ));
        };

        let spec = LaunchSpec {
            vm_id: vm_id.clone(),
            vm_dir: vm_dir.clone(),
            ip,
            kernel_path: self.config.kernel_path.clone(),
            rootfs_path: self.config.rootfs_path.clone(),
            memory_mb: self.config.memory_mb,
            cpu_count: self.config.cpu_count,
            boot_timeout: self.config.boot_timeout,
        };

        let handle = match self.hypervisor.launch(&spec).await {
            Ok(handle) => handle,
            Err(err) => {
                self.ips.lock().await.release(ip);
                let _ = tokio::fs::remove_dir_all(&vm_dir).await;
                return Err(err);
            }
        };
        self.handles.lock().await.insert(vm_id.clone(), handle);

        let now = Utc::now();
        let status = if warm { VmStatus::Ready } else { VmStatus::Busy };
        let record = VmRecord {
            id: vm_id.clone(),
            status: status.as_str().to_string(),
            ip: ip.to_string(),
            created_at: now,
            last_used: now,
            memory: self.config.memory_mb as i64,
            cpu: self.config.cpu_count as i64,
            is_warm: warm,
        };

        if let Err(err) = self.state.save_vm(&record).await {
            // Unwind the boot so a row-less VM never outlives this call.
            if let Some(mut handle) = self.handles.lock().await.remove(&vm_id) {
                let _ = self.hypervisor.shutdown(&mut handle).await;
            }
            self.ips.lock().await.release(ip);
            let _ = tokio::fs::remove_dir_all(&vm_dir).await;
            return Err(Error::VmCreateFailed(format!(
                "failed to persist VM record: {err}"
            )));
        }

        info!(%vm_id, %ip, warm, "Created VM");
        Ok(record)
    }
}
