//! Firecracker-backed runner.
//!
//! Each VM is one hypervisor process started with a generated machine
//! config. The guest stream is the hypervisor's vsock Unix socket
//! multiplexer; connecting means sending the `CONNECT <port>` preamble
//! and then waiting for the executor's readiness handshake. Lifecycle
//! commands (pause, snapshot, resume, shutdown) go over the per-VM API
//! socket as minimal HTTP/1.1 requests, the only protocol the control
//! surface speaks.
//!
//! All per-VM paths are kept relative inside a private working
//! directory and the hypervisor runs with that directory as its cwd, so
//! restored VMs re-create their sockets in their own workdir instead of
//! colliding with the provisioner's.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::profile::{MountMode, NetworkPolicy, PoolKey};
use crate::rpc::{self, GuestChannel, RpcClient};

use super::{
    RunnerError, Snapshot, SnapshotId, VmConfig, VmHandle, VmProcess, VmRunner, VmState,
};

/// vsock port the in-guest executor listens on.
const GUEST_PORT: u32 = 5000;

/// Grace period between the guest shutdown action and a forced kill.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Host-side configuration of the Firecracker backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirecrackerConfig {
    /// Hypervisor binary.
    pub firecracker_bin: PathBuf,
    /// Kernel image used for base boots.
    pub kernel_path: PathBuf,
    /// Root filesystem image used for base boots.
    pub rootfs_path: PathBuf,
    /// Directory holding per-pool snapshot artifacts.
    pub snapshot_dir: PathBuf,
    /// Parent directory for per-VM working directories.
    pub workdir_root: PathBuf,
    /// How long a boot may take before it counts as failed.
    #[serde(with = "humantime_serde")]
    pub boot_timeout: Duration,
}

impl Default for FirecrackerConfig {
    fn default() -> Self {
        Self {
            firecracker_bin: PathBuf::from("firecracker"),
            kernel_path: PathBuf::new(),
            rootfs_path: PathBuf::new(),
            snapshot_dir: PathBuf::from("/var/lib/firebreak/snapshots"),
            workdir_root: std::env::temp_dir().join("firebreak"),
            boot_timeout: Duration::from_secs(30),
        }
    }
}

/// [`VmRunner`] driving real Firecracker processes.
#[derive(Debug)]
pub struct FirecrackerRunner {
    config: FirecrackerConfig,
    // Guest CIDs below 100 are reserved by convention.
    cid_counter: AtomicU32,
}

impl FirecrackerRunner {
    /// Runner with the given host configuration.
    #[must_use]
    pub fn new(config: FirecrackerConfig) -> Self {
        Self {
            config,
            cid_counter: AtomicU32::new(100),
        }
    }

    fn next_cid(&self) -> u32 {
        self.cid_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Machine config handed to the hypervisor on boot.
    fn machine_config(&self, config: &VmConfig, cid: u32) -> serde_json::Value {
        let mut drives = vec![json!({
            "drive_id": "rootfs",
            "path_on_host": if config.rootfs_path.as_os_str().is_empty() {
                self.config.rootfs_path.clone()
            } else {
                config.rootfs_path.clone()
            },
            "is_root_device": true,
            "is_read_only": false,
        })];
        for (index, mount) in config.mounts.iter().enumerate() {
            drives.push(json!({
                "drive_id": format!("mount{index}"),
                "path_on_host": mount.path,
                "is_root_device": false,
                "is_read_only": mount.mode == MountMode::Read,
            }));
        }

        let mut machine = json!({
            "boot-source": {
                "kernel_image_path": if config.kernel_path.as_os_str().is_empty() {
                    self.config.kernel_path.clone()
                } else {
                    config.kernel_path.clone()
                },
                "boot_args": config.boot_args,
            },
            "drives": drives,
            "machine-config": {
                "vcpu_count": config.vcpu_count,
                "mem_size_mib": config.mem_size_mb,
            },
            "vsock": {
                "guest_cid": cid,
                "uds_path": "./vsock.sock",
            },
        });

        // A profile with no network gets no device at all. The
        // https-only policy attaches the device and relies on host-side
        // egress filtering of the tap.
        if config.net != NetworkPolicy::None {
            machine["network-interfaces"] = json!([{
                "iface_id": "eth0",
                "guest_mac": guest_mac(cid),
                "host_dev_name": format!("fbtap{cid:x}"),
            }]);
        }

        machine
    }

    async fn spawn_hypervisor(
        &self,
        workdir: &Path,
        extra_args: &[&str],
    ) -> Result<VmProcess, RunnerError> {
        tokio::fs::create_dir_all(workdir).await?;

        let mut command = Command::new(&self.config.firecracker_bin);
        command
            .arg("--api-sock")
            .arg("./firecracker.sock")
            .args(extra_args)
            .current_dir(workdir)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| RunnerError::BootFailure(format!("cannot spawn hypervisor: {e}")))?;

        Ok(VmProcess {
            child,
            workdir: workdir.to_path_buf(),
        })
    }

    /// Connect to the guest stream and wait for executor readiness.
    async fn connect_guest(&self, workdir: &Path) -> Result<GuestChannel, RunnerError> {
        let uds = workdir.join("vsock.sock");
        let deadline = tokio::time::Instant::now() + self.config.boot_timeout;

        loop {
            match try_vsock_connect(&uds).await {
                Ok(stream) => {
                    let mut channel = GuestChannel::Unix(stream);
                    rpc::read_handshake(&mut channel)
                        .await
                        .map_err(|e| RunnerError::BootFailure(e.to_string()))?;
                    return Ok(channel);
                },
                Err(e) if tokio::time::Instant::now() >= deadline => {
                    return Err(RunnerError::BootFailure(format!(
                        "guest stream never became ready: {e}"
                    )));
                },
                Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }
    }

    fn workdir_for(&self, id: &str) -> PathBuf {
        self.config.workdir_root.join(id)
    }
}

#[async_trait]
impl VmRunner for FirecrackerRunner {
    async fn boot(&self, config: &VmConfig) -> Result<VmHandle, RunnerError> {
        let cid = self.next_cid();
        let workdir = self.workdir_for(&format!("vm-{cid}"));
        tokio::fs::create_dir_all(&workdir).await?;

        let machine = self.machine_config(config, cid);
        tokio::fs::write(
            workdir.join("config.json"),
            serde_json::to_vec_pretty(&machine)
                .map_err(|e| RunnerError::BootFailure(e.to_string()))?,
        )
        .await?;

        info!(cid, workdir = %workdir.display(), "booting vm");
        let process = self
            .spawn_hypervisor(&workdir, &["--config-file", "./config.json"])
            .await?;

        let channel = self.connect_guest(&workdir).await?;
        let mut vm = VmHandle::new(RpcClient::new(channel));
        vm.control_endpoint = Some(workdir.join("firecracker.sock"));
        vm.process = Some(process);
        Ok(vm)
    }

    async fn snapshot(
        &self,
        vm: &mut VmHandle,
        pool_key: &PoolKey,
        dependencies: &[String],
    ) -> Result<Snapshot, RunnerError> {
        let api_sock = vm
            .control_endpoint
            .clone()
            .ok_or_else(|| RunnerError::ControlUnreachable("vm has no control socket".into()))?;

        let dir = self.config.snapshot_dir.join(pool_key.short());
        tokio::fs::create_dir_all(&dir).await?;
        let state_path = dir.join("vmstate");
        let mem_path = dir.join("mem");

        api_request(&api_sock, "PATCH", "/vm", &json!({"state": "Paused"})).await?;
        api_request(
            &api_sock,
            "PUT",
            "/snapshot/create",
            &json!({
                "snapshot_type": "Full",
                "snapshot_path": state_path,
                "mem_file_path": mem_path,
            }),
        )
        .await?;
        api_request(&api_sock, "PATCH", "/vm", &json!({"state": "Resumed"})).await?;

        let id = SnapshotId::new();
        info!(pool = %pool_key.short(), snapshot = %id, "snapshot captured");
        Ok(Snapshot {
            id,
            pool_key: *pool_key,
            mem_path,
            disk_path: state_path,
            dependencies: dependencies.to_vec(),
        })
    }

    async fn restore(&self, snapshot: &Snapshot) -> Result<VmHandle, RunnerError> {
        let cid = self.next_cid();
        let workdir = self.workdir_for(&format!("vm-{cid}"));

        info!(cid, snapshot = %snapshot.id, "restoring vm");
        let process = self.spawn_hypervisor(&workdir, &[]).await?;
        let api_sock = workdir.join("firecracker.sock");

        wait_for_socket(&api_sock, self.config.boot_timeout)
            .await
            .map_err(|e| RunnerError::RestoreFailure(e.to_string()))?;
        api_request(
            &api_sock,
            "PUT",
            "/snapshot/load",
            &json!({
                "snapshot_path": snapshot.disk_path,
                "mem_backend": {
                    "backend_type": "File",
                    "backend_path": snapshot.mem_path,
                },
                "resume_vm": true,
            }),
        )
        .await
        .map_err(|e| RunnerError::RestoreFailure(e.to_string()))?;

        let channel = self
            .connect_guest(&workdir)
            .await
            .map_err(|e| RunnerError::RestoreFailure(e.to_string()))?;
        let mut vm = VmHandle::new(RpcClient::new(channel));
        vm.control_endpoint = Some(api_sock);
        vm.snapshot_origin = Some(snapshot.id);
        vm.process = Some(process);
        Ok(vm)
    }

    async fn shutdown(&self, mut vm: VmHandle) {
        if let Some(api_sock) = vm.control_endpoint.clone() {
            let action = json!({"action_type": "SendCtrlAltDel"});
            if let Err(e) = api_request(&api_sock, "PUT", "/actions", &action).await {
                debug!(vm = %vm.id, error = %e, "graceful shutdown action failed");
            }
        }

        if let Some(process) = vm.process.as_mut() {
            match tokio::time::timeout(SHUTDOWN_GRACE, process.child.wait()).await {
                Ok(_) => {},
                Err(_) => {
                    warn!(vm = %vm.id, "guest ignored shutdown, killing");
                },
            }
        }
        self.hard_kill(&mut vm).await;
    }

    async fn hard_kill(&self, vm: &mut VmHandle) {
        if let Some(process) = vm.process.as_mut() {
            if let Err(e) = process.child.start_kill() {
                debug!(vm = %vm.id, error = %e, "kill signal not delivered");
            }
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, process.child.wait()).await;

            let workdir = process.workdir.clone();
            if let Err(e) = tokio::fs::remove_dir_all(&workdir).await {
                debug!(vm = %vm.id, error = %e, "workdir cleanup failed");
            }
        }
        vm.process = None;
        vm.state = VmState::Dead;
    }
}

/// MAC derived from the guest CID, stable across reboots of the same
/// slot.
fn guest_mac(cid: u32) -> String {
    format!("02:FC:00:00:{:02x}:{:02x}", (cid >> 8) & 0xFF, cid & 0xFF)
}

/// Open the hypervisor's vsock mux and tunnel to the executor port.
async fn try_vsock_connect(uds: &Path) -> Result<UnixStream, std::io::Error> {
    let mut stream = UnixStream::connect(uds).await?;
    stream
        .write_all(format!("CONNECT {GUEST_PORT}\n").as_bytes())
        .await?;

    // The mux answers `OK <port>\n` before handing the stream over.
    let mut ack = Vec::with_capacity(16);
    loop {
        let byte = stream.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        ack.push(byte);
        if ack.len() > 32 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "oversized vsock mux acknowledgement",
            ));
        }
    }
    if !ack.starts_with(b"OK") {
        return Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            format!("vsock mux refused: {}", String::from_utf8_lossy(&ack)),
        ));
    }
    Ok(stream)
}

/// Wait until a Unix socket path accepts connections.
async fn wait_for_socket(path: &Path, timeout: Duration) -> Result<(), std::io::Error> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match UnixStream::connect(path).await {
            Ok(_) => return Ok(()),
            Err(e) if tokio::time::Instant::now() >= deadline => return Err(e),
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
}

/// One request against the hypervisor API socket.
///
/// The API speaks plain HTTP/1.1 over the Unix socket; every command is
/// a small JSON body and success is any 2xx status.
async fn api_request(
    socket: &Path,
    method: &str,
    path: &str,
    body: &serde_json::Value,
) -> Result<(), RunnerError> {
    let mut stream = UnixStream::connect(socket)
        .await
        .map_err(|e| RunnerError::ControlUnreachable(e.to_string()))?;

    let body = serde_json::to_vec(body)
        .map_err(|e| RunnerError::ControlUnreachable(e.to_string()))?;
    let head = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;

    let mut response = Vec::with_capacity(256);
    let mut buf = [0u8; 256];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        response.extend_from_slice(&buf[..n]);
        if response.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }

    let status_line = response
        .split(|&b| b == b'\r')
        .next()
        .map(String::from_utf8_lossy)
        .unwrap_or_default();
    let ok = status_line
        .split_whitespace()
        .nth(1)
        .is_some_and(|code| code.starts_with('2'));
    if !ok {
        return Err(RunnerError::ControlUnreachable(format!(
            "{method} {path} answered '{status_line}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::FsMount;

    #[test]
    fn test_machine_config_shape() {
        let runner = FirecrackerRunner::new(FirecrackerConfig::default());
        let config = VmConfig {
            mounts: vec![FsMount::read("/data"), FsMount::read_write("/scratch")],
            net: NetworkPolicy::All,
            ..VmConfig::default()
        };

        let machine = runner.machine_config(&config, 101);
        let drives = machine["drives"].as_array().unwrap();
        assert_eq!(drives.len(), 3);
        assert_eq!(drives[1]["is_read_only"], true);
        assert_eq!(drives[2]["is_read_only"], false);
        assert_eq!(machine["vsock"]["guest_cid"], 101);
        assert!(machine["network-interfaces"].is_array());
    }

    #[test]
    fn test_no_network_device_without_policy() {
        let runner = FirecrackerRunner::new(FirecrackerConfig::default());
        let machine = runner.machine_config(&VmConfig::default(), 100);
        assert!(machine.get("network-interfaces").is_none());
    }

    #[test]
    fn test_guest_mac_is_cid_derived() {
        assert_eq!(guest_mac(0x0102), "02:FC:00:00:01:02");
    }
}
