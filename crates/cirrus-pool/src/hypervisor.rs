//! Hypervisor process management.
//!
//! The pool manager drives hypervisors through the `Hypervisor` trait so
//! tests can substitute a stub. The production implementation launches
//! Firecracker with a generated on-disk machine configuration and a per-VM
//! unix API socket, then waits for the socket to appear as the boot probe.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use cirrus_common::{Error, Result};

/// Everything the launcher needs to boot one VM.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub vm_id: String,
    pub vm_dir: PathBuf,
    pub ip: Ipv4Addr,
    pub kernel_path: PathBuf,
    pub rootfs_path: PathBuf,
    pub memory_mb: u32,
    pub cpu_count: u8,
    pub boot_timeout: Duration,
}

/// Handle to a launched VM. Holds the hypervisor child process for real VMs;
/// stub implementations leave it empty.
pub struct VmHandle {
    child: Option<Child>,
    pub api_socket: PathBuf,
}

impl VmHandle {
    /// Handle without a backing process, for hypervisor implementations that
    /// do not spawn one.
    pub fn detached(api_socket: PathBuf) -> Self {
        Self {
            child: None,
            api_socket,
        }
    }
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Boot a VM and return once it is confirmed up. Implementations must
    /// tear down anything they created before returning an error.
    async fn launch(&self, spec: &LaunchSpec) -> Result<VmHandle>;

    /// Force the VM down. Must be idempotent.
    async fn shutdown(&self, handle: &mut VmHandle) -> Result<()>;
}

/// Launches the Firecracker binary directly.
#[derive(Debug)]
pub struct FirecrackerHypervisor {
    binary: PathBuf,
}

impl FirecrackerHypervisor {
    pub fn new(binary: PathBuf) -> Result<Self> {
        if !binary.exists() {
            return Err(Error::VmCreateFailed(format!(
                "hypervisor binary not found at {}",
                binary.display()
            )));
        }
        Ok(Self { binary })
    }

    /// Machine configuration in Firecracker's `--config-file` format.
    fn machine_config(spec: &LaunchSpec, vm_dir: &Path) -> serde_json::Value {
        let tap_name = format!("fc-tap-{}", &spec.vm_id[..8]);
        serde_json::json!({
            "boot-source": {
                "kernel_image_path": spec.kernel_path,
                "boot_args": "console=ttyS0 reboot=k panic=1 pci=off",
            },
            "drives": [{
                "drive_id": "rootfs",
                "path_on_host": spec.rootfs_path,
                "is_root_device": true,
                "is_read_only": false,
            }],
            "machine-config": {
                "vcpu_count": spec.cpu_count,
                "mem_size_mib": spec.memory_mb,
                "smt": false,
            },
            "network-interfaces": [{
                "iface_id": "eth0",
                "host_dev_name": tap_name,
                "guest_mac": generate_mac(),
            }],
            "logger": {
                "log_path": vm_dir.join("firecracker.log"),
            },
            "metrics": {
                "metrics_path": vm_dir.join("firecracker.metrics"),
            },
        })
    }
}

#[async_trait]
impl Hypervisor for FirecrackerHypervisor {
    async fn launch(&self, spec: &LaunchSpec) -> Result<VmHandle> {
        let api_socket = spec.vm_dir.join("firecracker.sock");
        let config_path = spec.vm_dir.join("machine-config.json");

        let config = Self::machine_config(spec, &spec.vm_dir);
        let config_bytes = serde_json::to_vec_pretty(&config)
            .map_err(|e| Error::VmCreateFailed(format!("failed to encode machine config: {e}")))?;
        tokio::fs::write(&config_path, config_bytes)
            .await
            .map_err(|e| Error::VmCreateFailed(format!("failed to write machine config: {e}")))?;

        let mut child = Command::new(&self.binary)
            .arg("--id")
            .arg(&spec.vm_id)
            .arg("--api-sock")
            .arg(&api_socket)
            .arg("--config-file")
            .arg(&config_path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::VmCreateFailed(format!("failed to spawn hypervisor: {e}")))?;

        // Boot probe: the API socket appears once the VMM is serving. Bail
        // early if the process dies first.
        let deadline = tokio::time::Instant::now() + spec.boot_timeout;
        loop {
            if tokio::fs::try_exists(&api_socket).await.unwrap_or(false) {
                break;
            }
            if let Ok(Some(status)) = child.try_wait() {
                return Err(Error::VmCreateFailed(format!(
                    "hypervisor exited during boot with {status}"
                )));
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(Error::VmCreateFailed(format!(
                    "hypervisor did not confirm boot within {:?}",
                    spec.boot_timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        info!(vm_id = %spec.vm_id, ip = %spec.ip, "Hypervisor booted");
        Ok(VmHandle {
            child: Some(child),
            api_socket,
        })
    }

    async fn shutdown(&self, handle: &mut VmHandle) -> Result<()> {
        if let Some(child) = handle.child.as_mut() {
            if let Err(err) = child.start_kill() {
                // Already gone is fine.
                warn!(error = %err, "Hypervisor kill failed");
            }
            let _ = child.wait().await;
        }
        handle.child = None;
        let _ = tokio::fs::remove_file(&handle.api_socket).await;
        Ok(())
    }
}

fn generate_mac() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_config_shape() {
        let spec = LaunchSpec {
            vm_id: "0123456789abcdef".to_string(),
            vm_dir: PathBuf::from("/tmp/vm"),
            ip: Ipv4Addr::new(172, 16, 0, 2),
            kernel_path: PathBuf::from("/kernel/vmlinux.bin"),
            rootfs_path: PathBuf::from("/images/rootfs.ext4"),
            memory_mb: 256,
            cpu_count: 2,
            boot_timeout: Duration::from_secs(30),
        };
        let config = FirecrackerHypervisor::machine_config(&spec, &spec.vm_dir);

        assert_eq!(config["machine-config"]["vcpu_count"], 2);
        assert_eq!(config["machine-config"]["mem_size_mib"], 256);
        assert_eq!(config["drives"][0]["is_root_device"], true);
        assert_eq!(
            config["network-interfaces"][0]["host_dev_name"],
            "fc-tap-01234567"
        );
        let mac = config["network-interfaces"][0]["guest_mac"]
            .as_str()
            .unwrap();
        assert!(mac.starts_with("02:"));
        assert_eq!(mac.len(), 17);
    }

    #[test]
    fn test_missing_binary_is_rejected() {
        let err = FirecrackerHypervisor::new(PathBuf::from("/does/not/exist")).unwrap_err();
        assert!(matches!(err, Error::VmCreateFailed(_)));
    }
}
