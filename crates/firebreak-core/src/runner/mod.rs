//! VM runner backends.
//!
//! A [`VmRunner`] starts, snapshots, restores, and stops individual
//! micro VMs. The pool is the only caller; it owns every handle a runner
//! produces and enforces single use. Two backends satisfy the contract:
//! the real hypervisor backend ([`firecracker::FirecrackerRunner`]) and a
//! deterministic in-memory one for tests ([`mock::MockRunner`]).
//!
//! # VM lifecycle
//!
//! ```text
//! Booting ──ok──▶ Provisioning? ──ok──▶ Ready ──acquire──▶ InUse
//!    │                  │                   │                │
//!    │                  └──fail──▶ Dead     │                ├─ok, under cap──▶ Ready
//!    └──fail──▶ Dead                        └──idle reap──▶ Dead
//!                                                           └─fault or cap──▶ Tainted ──▶ Dead
//! ```

pub mod firecracker;
pub mod mock;

use std::path::PathBuf;
use std::time::Instant;

use async_trait::async_trait;
use uuid::Uuid;

use crate::profile::{CapabilityProfile, FsMount, NetworkPolicy, PoolKey};
use crate::rpc::{GuestChannel, RpcClient};

/// Unique identifier of one VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmId(Uuid);

impl VmId {
    /// Fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for VmId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for VmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of one snapshot artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotId(Uuid);

impl SnapshotId {
    /// Fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SnapshotId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Hypervisor started, guest not yet ready.
    Booting,
    /// First VM of a pool installing the dependency set.
    Provisioning,
    /// Warm and waiting for work.
    Ready,
    /// Serving exactly one call.
    InUse,
    /// Entered an unknown state; must not serve further calls.
    Tainted,
    /// Terminated and unusable.
    Dead,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Booting => write!(f, "booting"),
            Self::Provisioning => write!(f, "provisioning"),
            Self::Ready => write!(f, "ready"),
            Self::InUse => write!(f, "in_use"),
            Self::Tainted => write!(f, "tainted"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

/// Per-profile snapshot artifact: memory image plus disk state captured
/// after dependency provisioning.
///
/// Read-only once created; any number of restores may read it
/// concurrently. It outlives individual VMs and is dropped only with
/// its pool.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Artifact identity.
    pub id: SnapshotId,
    /// Pool this snapshot belongs to.
    pub pool_key: PoolKey,
    /// Guest memory image path.
    pub mem_path: PathBuf,
    /// Guest disk state path.
    pub disk_path: PathBuf,
    /// Dependency set captured in the image.
    pub dependencies: Vec<String>,
}

/// Boot-time machine configuration, derived from a profile.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VmConfig {
    /// Number of virtual CPUs.
    pub vcpu_count: u32,
    /// Guest memory ceiling in MiB.
    pub mem_size_mb: u32,
    /// Kernel image reference.
    pub kernel_path: PathBuf,
    /// Root filesystem image reference.
    pub rootfs_path: PathBuf,
    /// Kernel boot arguments.
    pub boot_args: String,
    /// Host paths exposed to the guest.
    pub mounts: Vec<FsMount>,
    /// Network backend selector.
    pub net: NetworkPolicy,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            vcpu_count: 1,
            mem_size_mb: 128,
            kernel_path: PathBuf::new(),
            rootfs_path: PathBuf::new(),
            boot_args: "console=ttyS0 reboot=k panic=1 pci=off".to_string(),
            mounts: Vec::new(),
            net: NetworkPolicy::None,
        }
    }
}

impl VmConfig {
    /// The same machine shaped by a profile's resource and capability
    /// declarations.
    #[must_use]
    pub fn with_profile(&self, profile: &CapabilityProfile) -> Self {
        Self {
            mem_size_mb: profile.mem_mb,
            mounts: profile.fs.clone(),
            net: profile.net,
            ..self.clone()
        }
    }
}

/// Hypervisor process owning one VM, tracked by the real backend.
#[derive(Debug)]
pub struct VmProcess {
    /// Child process handle.
    pub child: tokio::process::Child,
    /// Per-VM working directory holding sockets and configs.
    pub workdir: PathBuf,
}

/// One micro VM, owned by exactly one pool.
pub struct VmHandle {
    /// VM identity.
    pub id: VmId,
    /// Lifecycle state.
    pub state: VmState,
    /// Calls completed on this VM.
    pub call_count: u32,
    /// Boot or restore time.
    pub created_at: Instant,
    /// Completion time of the most recent call.
    pub last_used_at: Instant,
    /// Hypervisor control socket, when the backend has one.
    pub control_endpoint: Option<PathBuf>,
    /// Snapshot this VM was restored from, if any.
    pub snapshot_origin: Option<SnapshotId>,
    /// Framed client over the guest stream.
    pub client: RpcClient<GuestChannel>,
    /// Backing hypervisor process, if the backend runs one.
    pub process: Option<VmProcess>,
}

impl VmHandle {
    /// A freshly booted handle in [`VmState::Booting`].
    #[must_use]
    pub fn new(client: RpcClient<GuestChannel>) -> Self {
        let now = Instant::now();
        Self {
            id: VmId::new(),
            state: VmState::Booting,
            call_count: 0,
            created_at: now,
            last_used_at: now,
            control_endpoint: None,
            snapshot_origin: None,
            client,
            process: None,
        }
    }

    /// Record a completed call.
    pub fn mark_used(&mut self) {
        self.call_count += 1;
        self.last_used_at = Instant::now();
    }

    /// Time since the last completed call.
    #[must_use]
    pub fn idle_for(&self) -> std::time::Duration {
        self.last_used_at.elapsed()
    }
}

impl std::fmt::Debug for VmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmHandle")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("call_count", &self.call_count)
            .field("snapshot_origin", &self.snapshot_origin)
            .finish_non_exhaustive()
    }
}

/// Runner failures.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The VM never reached a ready guest.
    #[error("vm boot failed: {0}")]
    BootFailure(String),

    /// The backend cannot snapshot.
    #[error("backend does not support snapshots")]
    SnapshotUnsupported,

    /// Restoring from a snapshot failed.
    #[error("snapshot restore failed: {0}")]
    RestoreFailure(String),

    /// The hypervisor control socket did not respond.
    #[error("control socket unreachable: {0}")]
    ControlUnreachable(String),

    /// Transport I/O failure during boot or control.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Backend seam for VM lifecycle operations.
///
/// Two concurrent operations on the same handle are undefined; the pool
/// serializes them. `hard_kill` is idempotent and returns within a
/// bounded time.
#[async_trait]
pub trait VmRunner: Send + Sync {
    /// Boot a fresh VM from the base image. Returns only once the guest
    /// stream has produced the readiness handshake.
    async fn boot(&self, config: &VmConfig) -> Result<VmHandle, RunnerError>;

    /// Capture a snapshot of a provisioned VM.
    async fn snapshot(
        &self,
        vm: &mut VmHandle,
        pool_key: &PoolKey,
        dependencies: &[String],
    ) -> Result<Snapshot, RunnerError>;

    /// Produce a new warm VM from a snapshot.
    async fn restore(&self, snapshot: &Snapshot) -> Result<VmHandle, RunnerError>;

    /// Gracefully stop a VM.
    async fn shutdown(&self, vm: VmHandle);

    /// Forcefully terminate a VM. Idempotent; leaves the handle
    /// [`VmState::Dead`].
    async fn hard_kill(&self, vm: &mut VmHandle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_config_with_profile() {
        let profile = CapabilityProfile::builder()
            .mount(FsMount::read("/data"))
            .net(NetworkPolicy::HttpsOnly)
            .mem_mb(512)
            .build()
            .unwrap();
        let base = VmConfig::default();
        let shaped = base.with_profile(&profile);
        assert_eq!(shaped.mem_size_mb, 512);
        assert_eq!(shaped.net, NetworkPolicy::HttpsOnly);
        assert_eq!(shaped.mounts, profile.fs);
        assert_eq!(shaped.vcpu_count, base.vcpu_count);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(VmState::Ready.to_string(), "ready");
        assert_eq!(VmState::InUse.to_string(), "in_use");
    }
}
