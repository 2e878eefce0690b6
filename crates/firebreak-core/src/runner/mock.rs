//! Deterministic in-memory runner for tests.
//!
//! Every "VM" is a spawned task running the real executor loop over an
//! in-memory duplex stream, so the full wire contract (handshake,
//! framing, envelopes, install command) is exercised without a
//! hypervisor. Boot and restore latencies are configurable, installs can
//! be made to fail, and lifecycle operations are counted so tests can
//! assert properties like provisioning-exactly-once.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::executor::{self, ExecutorHost, FunctionRegistry, Installer, RemoteFailure};
use crate::profile::PoolKey;
use crate::rpc::{self, GuestChannel, RpcClient};

use super::{
    RunnerError, Snapshot, SnapshotId, VmConfig, VmHandle, VmId, VmRunner, VmState,
};

/// Lifecycle counters exposed to tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockCounters {
    /// Base-image boots.
    pub boot_calls: usize,
    /// Snapshot captures.
    pub snapshot_calls: usize,
    /// Snapshot restores.
    pub restore_calls: usize,
    /// Forced terminations.
    pub hard_kills: usize,
    /// Graceful shutdowns.
    pub shutdowns: usize,
    /// Restores observed before any snapshot existed.
    pub restores_before_snapshot: usize,
}

struct MockGuest {
    task: JoinHandle<()>,
    installed: Arc<Mutex<BTreeSet<String>>>,
}

#[derive(Default)]
struct MockState {
    counters: MockCounters,
    guests: HashMap<VmId, MockGuest>,
}

/// In-memory [`VmRunner`] with deterministic latencies.
pub struct MockRunner {
    registry: Arc<FunctionRegistry>,
    boot_delay: Duration,
    restore_delay: Duration,
    install_delay: Duration,
    fail_install: Arc<AtomicBool>,
    fail_boots: AtomicUsize,
    inner: Mutex<MockState>,
}

impl MockRunner {
    /// Runner serving calls from `registry`, with a 10 ms boot and a
    /// 2 ms restore.
    #[must_use]
    pub fn new(registry: Arc<FunctionRegistry>) -> Self {
        Self {
            registry,
            boot_delay: Duration::from_millis(10),
            restore_delay: Duration::from_millis(2),
            install_delay: Duration::from_millis(5),
            fail_install: Arc::new(AtomicBool::new(false)),
            fail_boots: AtomicUsize::new(0),
            inner: Mutex::new(MockState::default()),
        }
    }

    /// Override the simulated boot latency.
    #[must_use]
    pub const fn with_boot_delay(mut self, delay: Duration) -> Self {
        self.boot_delay = delay;
        self
    }

    /// Override the simulated restore latency.
    #[must_use]
    pub const fn with_restore_delay(mut self, delay: Duration) -> Self {
        self.restore_delay = delay;
        self
    }

    /// Make the next `n` boots fail.
    pub fn fail_next_boots(&self, n: usize) {
        self.fail_boots.store(n, Ordering::SeqCst);
    }

    /// Make dependency installs fail from now on.
    pub fn set_install_failure(&self, fail: bool) {
        self.fail_install.store(fail, Ordering::SeqCst);
    }

    /// Current lifecycle counters.
    #[must_use]
    pub fn counters(&self) -> MockCounters {
        self.inner.lock().counters
    }

    /// Abort every guest task, closing their streams. The host observes
    /// EOF on the next read, as it would after a guest crash.
    pub fn sever_all(&self) {
        let inner = self.inner.lock();
        for guest in inner.guests.values() {
            guest.task.abort();
        }
    }

    /// Installed dependency set of a live VM, for assertions.
    #[must_use]
    pub fn installed_in(&self, id: VmId) -> Option<Vec<String>> {
        self.inner
            .lock()
            .guests
            .get(&id)
            .map(|g| g.installed.lock().iter().cloned().collect())
    }

    fn spawn_guest(&self, preinstalled: BTreeSet<String>) -> (GuestChannel, MockGuest) {
        let (host_side, guest_side) = tokio::io::duplex(256 * 1024);
        let installed = Arc::new(Mutex::new(preinstalled));
        let installer = Arc::new(MockInstaller {
            installed: Arc::clone(&installed),
            fail: Arc::clone(&self.fail_install),
            delay: self.install_delay,
        });
        let host = ExecutorHost::new(Arc::clone(&self.registry), installer);
        let task = tokio::spawn(async move {
            let _ = executor::serve(guest_side, host).await;
        });
        (GuestChannel::Duplex(host_side), MockGuest { task, installed })
    }

    async fn start_vm(
        &self,
        preinstalled: BTreeSet<String>,
    ) -> Result<VmHandle, RunnerError> {
        let (mut channel, guest) = self.spawn_guest(preinstalled);
        rpc::read_handshake(&mut channel)
            .await
            .map_err(|e| RunnerError::BootFailure(e.to_string()))?;

        let vm = VmHandle::new(RpcClient::new(channel));
        self.inner.lock().guests.insert(vm.id, guest);
        Ok(vm)
    }

    fn reap_guest(&self, id: VmId) -> bool {
        let mut inner = self.inner.lock();
        if let Some(guest) = inner.guests.remove(&id) {
            guest.task.abort();
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for MockRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRunner")
            .field("counters", &self.counters())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl VmRunner for MockRunner {
    async fn boot(&self, _config: &VmConfig) -> Result<VmHandle, RunnerError> {
        self.inner.lock().counters.boot_calls += 1;
        if self
            .fail_boots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RunnerError::BootFailure("injected boot failure".into()));
        }

        tokio::time::sleep(self.boot_delay).await;
        let vm = self.start_vm(BTreeSet::new()).await?;
        debug!(vm = %vm.id, "mock vm booted");
        Ok(vm)
    }

    async fn snapshot(
        &self,
        vm: &mut VmHandle,
        pool_key: &PoolKey,
        _dependencies: &[String],
    ) -> Result<Snapshot, RunnerError> {
        let installed = {
            let mut inner = self.inner.lock();
            inner.counters.snapshot_calls += 1;
            inner
                .guests
                .get(&vm.id)
                .map(|g| g.installed.lock().clone())
                .ok_or_else(|| RunnerError::ControlUnreachable(format!("unknown vm {}", vm.id)))?
        };

        let id = SnapshotId::new();
        debug!(vm = %vm.id, snapshot = %id, "mock snapshot captured");
        Ok(Snapshot {
            id,
            pool_key: *pool_key,
            mem_path: PathBuf::from(format!("/run/firebreak-mock/{id}/mem")),
            disk_path: PathBuf::from(format!("/run/firebreak-mock/{id}/disk")),
            dependencies: installed.into_iter().collect(),
        })
    }

    async fn restore(&self, snapshot: &Snapshot) -> Result<VmHandle, RunnerError> {
        {
            let mut inner = self.inner.lock();
            if inner.counters.snapshot_calls == 0 {
                inner.counters.restores_before_snapshot += 1;
            }
            inner.counters.restore_calls += 1;
        }

        tokio::time::sleep(self.restore_delay).await;
        let preinstalled = snapshot.dependencies.iter().cloned().collect();
        let mut vm = self
            .start_vm(preinstalled)
            .await
            .map_err(|e| RunnerError::RestoreFailure(e.to_string()))?;
        vm.snapshot_origin = Some(snapshot.id);
        debug!(vm = %vm.id, snapshot = %snapshot.id, "mock vm restored");
        Ok(vm)
    }

    async fn shutdown(&self, vm: VmHandle) {
        if self.reap_guest(vm.id) {
            self.inner.lock().counters.shutdowns += 1;
        }
        debug!(vm = %vm.id, "mock vm shut down");
    }

    async fn hard_kill(&self, vm: &mut VmHandle) {
        if self.reap_guest(vm.id) {
            self.inner.lock().counters.hard_kills += 1;
        }
        vm.state = VmState::Dead;
    }
}

/// Installer recording the dependency set in memory.
struct MockInstaller {
    installed: Arc<Mutex<BTreeSet<String>>>,
    fail: Arc<AtomicBool>,
    delay: Duration,
}

#[async_trait]
impl Installer for MockInstaller {
    async fn install(&self, dependencies: &[String]) -> Result<(), RemoteFailure> {
        tokio::time::sleep(self.delay).await;
        if self.fail.load(Ordering::SeqCst) {
            return Err(RemoteFailure::new(
                "InstallError",
                "injected install failure",
            ));
        }
        self.installed
            .lock()
            .extend(dependencies.iter().cloned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::codec::{self, Value};
    use crate::rpc::{RpcRequest, RpcResponse};

    fn registry() -> Arc<FunctionRegistry> {
        let registry = Arc::new(FunctionRegistry::new());
        registry.register("m:one", |_args, _kwargs| Ok(Value::Int(1)));
        registry
    }

    fn call_request(call_id: u64) -> RpcRequest {
        RpcRequest::Call {
            call_id,
            function_ref: "m:one".to_string(),
            args: Bytes::from(codec::encode(&Value::Seq(Vec::new())).unwrap()),
            kwargs: Bytes::from(codec::encode(&Value::Map(Vec::new())).unwrap()),
            deadline_ms: 500,
        }
    }

    #[tokio::test]
    async fn test_boot_serves_calls() {
        let runner = MockRunner::new(registry());
        let mut vm = runner.boot(&VmConfig::default()).await.unwrap();
        let response = vm
            .client
            .call(
                &call_request(1),
                Instant::now() + Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(matches!(response, RpcResponse::Ok { .. }));
        assert_eq!(runner.counters().boot_calls, 1);
        runner.hard_kill(&mut vm).await;
        assert_eq!(vm.state, VmState::Dead);
    }

    #[tokio::test]
    async fn test_injected_boot_failure() {
        let runner = MockRunner::new(registry());
        runner.fail_next_boots(1);
        assert!(runner.boot(&VmConfig::default()).await.is_err());
        assert!(runner.boot(&VmConfig::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_snapshot_captures_installed_set() {
        let runner = MockRunner::new(registry());
        let mut vm = runner.boot(&VmConfig::default()).await.unwrap();

        let install = RpcRequest::Install {
            call_id: 5,
            dependencies: vec!["requests".to_string()],
        };
        let response = vm
            .client
            .call(
                &install,
                Instant::now() + Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(matches!(response, RpcResponse::Ok { .. }));

        let key = crate::profile::CapabilityProfile::builder()
            .build()
            .unwrap()
            .pool_key();
        let snapshot = runner
            .snapshot(&mut vm, &key, &["requests".to_string()])
            .await
            .unwrap();
        assert_eq!(snapshot.dependencies, vec!["requests".to_string()]);

        let restored = runner.restore(&snapshot).await.unwrap();
        assert_eq!(restored.snapshot_origin, Some(snapshot.id));
        assert_eq!(
            runner.installed_in(restored.id).unwrap(),
            vec!["requests".to_string()]
        );
    }

    #[tokio::test]
    async fn test_hard_kill_is_idempotent() {
        let runner = MockRunner::new(registry());
        let mut vm = runner.boot(&VmConfig::default()).await.unwrap();
        runner.hard_kill(&mut vm).await;
        runner.hard_kill(&mut vm).await;
        assert_eq!(runner.counters().hard_kills, 1);
    }

    #[tokio::test]
    async fn test_severed_guest_reads_as_crash() {
        let runner = MockRunner::new(registry());
        let mut vm = runner.boot(&VmConfig::default()).await.unwrap();
        runner.sever_all();
        let err = vm
            .client
            .call(
                &call_request(1),
                Instant::now() + Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, crate::rpc::RpcError::RemoteCrash));
    }
}
