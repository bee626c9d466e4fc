//! Pool and VM sizing configuration, read from the environment at startup.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_HYPERVISOR_PATH: &str = "CIRRUS_HYPERVISOR_PATH";
pub const ENV_KERNEL_PATH: &str = "CIRRUS_VM_KERNEL_PATH";
pub const ENV_ROOTFS_PATH: &str = "CIRRUS_VM_ROOTFS_PATH";
pub const ENV_MEMORY_MB: &str = "CIRRUS_VM_MEMORY_MB";
pub const ENV_CPU_COUNT: &str = "CIRRUS_VM_CPU_COUNT";
pub const ENV_BASE_DIR: &str = "CIRRUS_VM_BASE_DIR";
pub const ENV_SUBNET: &str = "CIRRUS_VM_SUBNET";
pub const ENV_WARM_POOL_SIZE: &str = "WARM_POOL_SIZE";

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Target number of pre-booted VMs kept ready (`W`).
    pub warm_pool_size: usize,
    /// Per-VM working directories live under this path, keyed by VM id.
    pub base_dir: PathBuf,
    pub hypervisor_path: PathBuf,
    pub kernel_path: PathBuf,
    pub rootfs_path: PathBuf,
    pub memory_mb: u32,
    pub cpu_count: u8,
    /// Network the guest addresses are drawn from; .1 is the host bridge.
    pub subnet: Ipv4Addr,
    /// How long to wait for the hypervisor to confirm boot.
    pub boot_timeout: Duration,
    /// Warm-pool top-up cadence.
    pub refill_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            warm_pool_size: 5,
            base_dir: PathBuf::from("vm-storage"),
            hypervisor_path: PathBuf::from("/usr/local/bin/firecracker"),
            kernel_path: PathBuf::from("/var/lib/cirrus/kernel/vmlinux.bin"),
            rootfs_path: PathBuf::from("/var/lib/cirrus/images/rootfs.ext4"),
            memory_mb: 128,
            cpu_count: 1,
            subnet: Ipv4Addr::new(172, 16, 0, 0),
            boot_timeout: Duration::from_secs(30),
            refill_interval: Duration::from_secs(10),
        }
    }
}

impl PoolConfig {
    /// Build from the environment, falling back to the defaults above for
    /// anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(size) = env_parse(ENV_WARM_POOL_SIZE) {
            config.warm_pool_size = size;
        }
        if let Some(dir) = env_path(ENV_BASE_DIR) {
            config.base_dir = dir;
        }
        if let Some(path) = env_path(ENV_HYPERVISOR_PATH) {
            config.hypervisor_path = path;
        }
        if let Some(path) = env_path(ENV_KERNEL_PATH) {
            config.kernel_path = path;
        }
        if let Some(path) = env_path(ENV_ROOTFS_PATH) {
            config.rootfs_path = path;
        }
        if let Some(memory) = env_parse(ENV_MEMORY_MB) {
            config.memory_mb = memory;
        }
        if let Some(cpus) = env_parse(ENV_CPU_COUNT) {
            config.cpu_count = cpus;
        }
        if let Some(subnet) = std::env::var(ENV_SUBNET).ok().and_then(|s| parse_subnet(&s)) {
            config.subnet = subnet;
        }
        config
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Accepts "a.b.c.0/24" or a bare "a.b.c.0"; only the network base is kept.
fn parse_subnet(value: &str) -> Option<Ipv4Addr> {
    value.split('/').next()?.parse().ok()
}
