//! Per-profile warm VM pools.
//!
//! One [`VmWorkerPool`] owns every VM of one capability profile plus, at
//! most, one provisioning snapshot. Acquisition hands out exclusive
//! [`VmHandle`]s; release decides between returning a VM to the warm set
//! and recycling it. Waiters are served strictly first-in first-out, and
//! a VM that becomes ready goes to the head of the queue before it is
//! parked in the ready set.
//!
//! The pool's mutable state lives behind a single mutex that is only
//! held for constant-time bookkeeping. All waiting happens on oneshot
//! channels outside the lock, and every runner operation runs on a
//! spawned task, so acquisition never blocks on a boot.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::profile::{CapabilityProfile, PoolKey};
use crate::rpc::{CallIds, RpcRequest, RpcResponse};
use crate::runner::{Snapshot, VmConfig, VmHandle, VmRunner, VmState};

/// Sizing and timing knobs of one pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Warm VMs to keep around.
    pub min_size: usize,
    /// Hard ceiling on live VMs (ready, in use, and booting together).
    pub max_size: usize,
    /// Calls served by one VM before it is recycled.
    pub max_calls_per_vm: u32,
    /// Idle time after which a surplus ready VM is reaped.
    #[serde(with = "humantime_serde")]
    pub max_idle: Duration,
    /// Extra time beyond the call budget a caller will wait for a VM.
    #[serde(with = "humantime_serde")]
    pub pool_wait_slack: Duration,
    /// Host-side grace added to the call budget for wire latency.
    #[serde(with = "humantime_serde")]
    pub network_grace: Duration,
    /// Cadence of the maintenance task.
    #[serde(with = "humantime_serde")]
    pub maintenance_interval: Duration,
    /// Budget for one dependency installation.
    #[serde(with = "humantime_serde")]
    pub install_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            max_calls_per_vm: 100,
            max_idle: Duration::from_secs(300),
            pool_wait_slack: Duration::from_secs(10),
            network_grace: Duration::from_millis(25),
            maintenance_interval: Duration::from_secs(30),
            install_timeout: Duration::from_secs(300),
        }
    }
}

/// How a dispatched call ended, from the pool's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// Clean completion, including remote exceptions: the stream stayed
    /// in lockstep, so the VM is reusable.
    Ok,
    /// The host-side deadline expired mid-call.
    Timeout,
    /// The wire contract was violated.
    Protocol,
    /// The guest stream closed unexpectedly.
    RemoteCrash,
    /// The caller cancelled mid-call.
    Cancelled,
}

impl CallOutcome {
    /// Whether the VM behind the call must be recycled.
    #[must_use]
    pub const fn taints(self) -> bool {
        !matches!(self, Self::Ok)
    }
}

/// Acquisition failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    /// No VM became available within the deadline.
    #[error("no vm available within the acquisition deadline")]
    Exhausted,

    /// Dependency provisioning failed; the pool is poisoned.
    #[error("pool provisioning failed: {0}")]
    Provisioning(String),

    /// The pool or manager is draining.
    #[error("pool is shut down")]
    Shutdown,

    /// The caller cancelled while waiting.
    #[error("acquisition cancelled")]
    Cancelled,
}

/// Observable occupancy of a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounts {
    /// Warm VMs waiting for work.
    pub ready: usize,
    /// VMs serving a call.
    pub in_use: usize,
    /// Boot or restore operations in flight.
    pub booting: usize,
}

impl PoolCounts {
    /// Every live or nearly-live VM.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.ready + self.in_use + self.booting
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PoolPhase {
    /// Installing dependencies and capturing the snapshot.
    Provisioning,
    /// Serving acquisitions.
    Serving,
    /// Provisioning failed; every acquisition fails fast.
    Poisoned(String),
    /// Draining.
    Shutdown,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Result<VmHandle, PoolError>>,
}

struct PoolInner {
    phase: PoolPhase,
    snapshot: Option<Snapshot>,
    ready: VecDeque<VmHandle>,
    in_use: usize,
    booting: usize,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
}

impl PoolInner {
    fn total(&self) -> usize {
        self.ready.len() + self.in_use + self.booting
    }

    fn counts(&self) -> PoolCounts {
        PoolCounts {
            ready: self.ready.len(),
            in_use: self.in_use,
            booting: self.booting,
        }
    }
}

/// Warm VM pool for one capability profile.
pub struct VmWorkerPool {
    key: PoolKey,
    profile: CapabilityProfile,
    config: PoolConfig,
    vm_config: VmConfig,
    runner: Arc<dyn VmRunner>,
    call_ids: CallIds,
    inner: Mutex<PoolInner>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl VmWorkerPool {
    /// Create the pool and start provisioning, warm-up, and
    /// maintenance in the background.
    #[must_use]
    pub fn new(
        profile: CapabilityProfile,
        base_vm_config: &VmConfig,
        config: PoolConfig,
        runner: Arc<dyn VmRunner>,
        call_ids: CallIds,
    ) -> Arc<Self> {
        let key = profile.pool_key();
        let vm_config = base_vm_config.with_profile(&profile);
        let needs_provisioning = !profile.dependencies.is_empty();

        let pool = Arc::new(Self {
            key,
            profile,
            config,
            vm_config,
            runner,
            call_ids,
            inner: Mutex::new(PoolInner {
                phase: if needs_provisioning {
                    PoolPhase::Provisioning
                } else {
                    PoolPhase::Serving
                },
                snapshot: None,
                ready: VecDeque::new(),
                in_use: 0,
                booting: 0,
                waiters: VecDeque::new(),
                next_waiter_id: 0,
            }),
            background: Mutex::new(Vec::new()),
        });

        let init = tokio::spawn(Arc::clone(&pool).initialize(needs_provisioning));
        let maintenance = tokio::spawn(Arc::clone(&pool).maintenance_loop());
        pool.background.lock().extend([init, maintenance]);
        pool
    }

    /// Profile identity of this pool.
    #[must_use]
    pub const fn key(&self) -> &PoolKey {
        &self.key
    }

    /// The profile this pool serves.
    #[must_use]
    pub const fn profile(&self) -> &CapabilityProfile {
        &self.profile
    }

    /// Pool configuration.
    #[must_use]
    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Current occupancy.
    #[must_use]
    pub fn counts(&self) -> PoolCounts {
        self.inner.lock().counts()
    }

    /// Call counts of the VMs currently in the ready set.
    #[must_use]
    pub fn ready_call_counts(&self) -> Vec<u32> {
        self.inner.lock().ready.iter().map(|vm| vm.call_count).collect()
    }

    /// Whether provisioning failed permanently.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        matches!(self.inner.lock().phase, PoolPhase::Poisoned(_))
    }

    /// Acquire an exclusive VM, waiting until `deadline` at most.
    ///
    /// # Errors
    ///
    /// [`PoolError::Exhausted`] on deadline expiry,
    /// [`PoolError::Cancelled`] if `cancel` fires while queued,
    /// [`PoolError::Provisioning`] on a poisoned pool, and
    /// [`PoolError::Shutdown`] while draining.
    pub async fn acquire(
        self: &Arc<Self>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<VmHandle, PoolError> {
        let (waiter_id, rx) = {
            let mut inner = self.inner.lock();
            match &inner.phase {
                PoolPhase::Poisoned(reason) => {
                    return Err(PoolError::Provisioning(reason.clone()));
                },
                PoolPhase::Shutdown => return Err(PoolError::Shutdown),
                PoolPhase::Provisioning | PoolPhase::Serving => {},
            }

            if let Some(mut vm) = inner.ready.pop_front() {
                vm.state = VmState::InUse;
                inner.in_use += 1;
                return Ok(vm);
            }

            // Start growing only while serving; during provisioning the
            // snapshot does not exist yet and boots would bypass it.
            if inner.phase == PoolPhase::Serving && inner.total() < self.config.max_size {
                inner.booting += 1;
                self.spawn_vm_start();
            }

            let id = inner.next_waiter_id;
            inner.next_waiter_id += 1;
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(Waiter { id, tx });
            (id, rx)
        };

        let mut rx = rx;
        let wait = tokio::time::timeout_at(deadline, async {
            tokio::select! {
                () = cancel.cancelled() => None,
                handed = &mut rx => Some(handed),
            }
        })
        .await;

        match wait {
            Err(_) => {
                self.abandon_waiter(waiter_id, rx);
                Err(PoolError::Exhausted)
            },
            Ok(None) => {
                self.abandon_waiter(waiter_id, rx);
                Err(PoolError::Cancelled)
            },
            // Sender dropped without a message: the pool was torn down
            // from under the waiter.
            Ok(Some(Err(_))) => Err(PoolError::Shutdown),
            Ok(Some(Ok(result))) => result,
        }
    }

    /// Return a VM after a call.
    ///
    /// A clean outcome under the per-VM call cap parks the VM back in
    /// the warm set (or hands it straight to the next waiter). Anything
    /// else taints the VM: it is killed in the background and, when the
    /// pool dropped below its minimum, a replacement boot is started.
    pub fn release(self: &Arc<Self>, mut vm: VmHandle, outcome: CallOutcome) {
        vm.mark_used();
        let mut inner = self.inner.lock();
        inner.in_use = inner.in_use.saturating_sub(1);

        if inner.phase == PoolPhase::Shutdown {
            drop(inner);
            self.spawn_destroy(vm, false);
            return;
        }

        let over_cap = vm.call_count >= self.config.max_calls_per_vm;
        if outcome.taints() || over_cap {
            vm.state = VmState::Tainted;
            debug!(vm = %vm.id, pool = %self.key.short(), ?outcome, over_cap, "recycling vm");

            let replace = inner.total() < self.config.min_size
                && inner.phase == PoolPhase::Serving;
            if replace {
                inner.booting += 1;
            }
            drop(inner);

            self.spawn_destroy(vm, true);
            if replace {
                self.spawn_vm_start();
            }
            return;
        }

        vm.state = VmState::Ready;
        self.hand_off_or_park(&mut inner, vm);
    }

    /// Put back a VM that was handed to a waiter which had already
    /// given up. The VM served no call, so its counters stay untouched.
    fn reinsert(self: &Arc<Self>, mut vm: VmHandle) {
        let mut inner = self.inner.lock();
        inner.in_use = inner.in_use.saturating_sub(1);
        if inner.phase == PoolPhase::Shutdown {
            drop(inner);
            self.spawn_destroy(vm, false);
            return;
        }
        vm.state = VmState::Ready;
        self.hand_off_or_park(&mut inner, vm);
    }

    /// Drain the pool: fail queued waiters, stop the background tasks,
    /// kill warm VMs, and drop the snapshot. VMs still serving a call
    /// are destroyed when they are released. Idempotent.
    pub async fn shutdown(self: &Arc<Self>) {
        let (waiters, ready) = {
            let mut inner = self.inner.lock();
            if inner.phase == PoolPhase::Shutdown {
                return;
            }
            inner.phase = PoolPhase::Shutdown;
            inner.snapshot = None;
            (
                std::mem::take(&mut inner.waiters),
                std::mem::take(&mut inner.ready),
            )
        };

        info!(pool = %self.key.short(), "pool shutting down");
        for waiter in waiters {
            let _ = waiter.tx.send(Err(PoolError::Shutdown));
        }
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
        for vm in ready {
            self.runner.shutdown(vm).await;
        }
    }

    /// Drop a timed-out or cancelled waiter. When the race was lost and
    /// a VM is already in the channel, the VM goes back to the pool.
    fn abandon_waiter(
        self: &Arc<Self>,
        waiter_id: u64,
        mut rx: oneshot::Receiver<Result<VmHandle, PoolError>>,
    ) {
        let removed = {
            let mut inner = self.inner.lock();
            let before = inner.waiters.len();
            inner.waiters.retain(|w| w.id != waiter_id);
            inner.waiters.len() != before
        };
        if !removed {
            if let Ok(Ok(vm)) = rx.try_recv() {
                self.reinsert(vm);
            }
        }
    }

    /// Hand a ready VM to the head of the waiter queue, or park it.
    ///
    /// Called with the pool lock held; only constant-time work happens
    /// here.
    fn hand_off_or_park(self: &Arc<Self>, inner: &mut PoolInner, mut vm: VmHandle) {
        if inner.phase == PoolPhase::Shutdown {
            let pool = Arc::clone(self);
            tokio::spawn(async move { pool.runner.shutdown(vm).await });
            return;
        }

        while let Some(waiter) = inner.waiters.pop_front() {
            vm.state = VmState::InUse;
            match waiter.tx.send(Ok(vm)) {
                Ok(()) => {
                    inner.in_use += 1;
                    return;
                },
                // The waiter gave up between enqueueing and now; try
                // the next one.
                Err(Ok(returned)) => vm = returned,
                Err(Err(_)) => unreachable!("we only ever send Ok through waiter channels"),
            }
        }
        vm.state = VmState::Ready;
        inner.ready.push_back(vm);
    }

    fn spawn_vm_start(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.start_one_vm().await;
        });
    }

    fn spawn_destroy(self: &Arc<Self>, vm: VmHandle, hard: bool) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut vm = vm;
            if hard {
                pool.runner.hard_kill(&mut vm).await;
            } else {
                pool.runner.shutdown(vm).await;
            }
        });
    }

    /// Boot or restore one VM and publish it. The `booting` slot was
    /// reserved by the caller.
    async fn start_one_vm(self: Arc<Self>) {
        let snapshot = self.inner.lock().snapshot.clone();
        let started = match &snapshot {
            Some(snapshot) => self.runner.restore(snapshot).await,
            None => self.runner.boot(&self.vm_config).await,
        };

        let mut inner = self.inner.lock();
        inner.booting = inner.booting.saturating_sub(1);
        match started {
            Ok(mut vm) => {
                vm.state = VmState::Ready;
                self.hand_off_or_park(&mut inner, vm);
            },
            Err(e) => {
                // Maintenance refills the gap on its next tick.
                warn!(pool = %self.key.short(), error = %e, "vm start failed");
            },
        }
    }

    /// First-use setup: provision the snapshot when the profile has
    /// dependencies, then warm the pool up to its minimum.
    async fn initialize(self: Arc<Self>, needs_provisioning: bool) {
        if needs_provisioning {
            if let Err(e) = self.provision().await {
                error!(pool = %self.key.short(), error = %e, "provisioning failed, poisoning pool");
                self.poison(e.to_string());
                return;
            }
        }

        let boots = {
            let mut inner = self.inner.lock();
            if inner.phase == PoolPhase::Shutdown {
                return;
            }
            inner.phase = PoolPhase::Serving;
            let wanted = self
                .config
                .min_size
                .max(inner.waiters.len())
                .min(self.config.max_size);
            let boots = wanted.saturating_sub(inner.total());
            inner.booting += boots;
            boots
        };
        debug!(pool = %self.key.short(), boots, "pool warming up");
        for _ in 0..boots {
            self.spawn_vm_start();
        }
    }

    /// Boot a provisioner VM, install the dependency set through the
    /// executor, capture the snapshot, and retire the provisioner. Runs
    /// at most once per pool.
    async fn provision(&self) -> Result<(), PoolError> {
        info!(
            pool = %self.key.short(),
            dependencies = ?self.profile.dependencies,
            "provisioning pool snapshot"
        );

        let mut vm = self
            .runner
            .boot(&self.vm_config)
            .await
            .map_err(|e| PoolError::Provisioning(e.to_string()))?;
        vm.state = VmState::Provisioning;

        let request = RpcRequest::Install {
            call_id: self.call_ids.next(),
            dependencies: self.profile.dependencies.clone(),
        };
        let deadline = Instant::now() + self.config.install_timeout;
        let response = vm
            .client
            .call(&request, deadline, &CancellationToken::new())
            .await;

        let result = match response {
            Ok(RpcResponse::Ok { .. }) => {
                self.runner
                    .snapshot(&mut vm, &self.key, &self.profile.dependencies)
                    .await
                    .map_err(|e| PoolError::Provisioning(e.to_string()))
            },
            Ok(RpcResponse::Err { kind, message, .. }) => Err(PoolError::Provisioning(format!(
                "dependency install failed: {kind}: {message}"
            ))),
            Err(e) => Err(PoolError::Provisioning(format!(
                "dependency install failed: {e}"
            ))),
        };

        match result {
            Ok(snapshot) => {
                info!(pool = %self.key.short(), snapshot = %snapshot.id, "snapshot ready");
                self.inner.lock().snapshot = Some(snapshot);
                self.runner.shutdown(vm).await;
                Ok(())
            },
            Err(e) => {
                self.runner.shutdown(vm).await;
                Err(e)
            },
        }
    }

    fn poison(&self, reason: String) {
        let waiters = {
            let mut inner = self.inner.lock();
            if inner.phase == PoolPhase::Shutdown {
                return;
            }
            inner.phase = PoolPhase::Poisoned(reason.clone());
            std::mem::take(&mut inner.waiters)
        };
        for waiter in waiters {
            let _ = waiter.tx.send(Err(PoolError::Provisioning(reason.clone())));
        }
    }

    /// Periodic upkeep: top the pool up to its minimum and reap surplus
    /// VMs that sat idle too long. Work per tick is bounded by the pool
    /// size and never blocks acquisition.
    async fn maintenance_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.maintenance_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;

            let (boots, reaped) = {
                let mut inner = self.inner.lock();
                match inner.phase {
                    PoolPhase::Serving => {},
                    PoolPhase::Shutdown | PoolPhase::Poisoned(_) => return,
                    PoolPhase::Provisioning => continue,
                }

                let deficit = self.config.min_size.saturating_sub(inner.total());
                inner.booting += deficit;

                let mut reaped = Vec::new();
                while inner.ready.len() > self.config.min_size {
                    match inner.ready.front() {
                        Some(front) if front.idle_for() >= self.config.max_idle => {
                            if let Some(vm) = inner.ready.pop_front() {
                                reaped.push(vm);
                            }
                        },
                        _ => break,
                    }
                }
                (deficit, reaped)
            };

            for _ in 0..boots {
                self.spawn_vm_start();
            }
            for vm in reaped {
                debug!(pool = %self.key.short(), vm = %vm.id, "reaping idle vm");
                self.spawn_destroy(vm, false);
            }
        }
    }
}

impl std::fmt::Debug for VmWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmWorkerPool")
            .field("key", &self.key)
            .field("counts", &self.counts())
            .finish_non_exhaustive()
    }
}

