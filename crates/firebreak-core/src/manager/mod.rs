//! Pool manager: the key-to-pool table.
//!
//! Maps [`PoolKey`]s to their pools, constructing each pool lazily on
//! first use. Construction is serialized per manager so exactly one
//! pool exists per key; lookups after that take only a read lock.
//! Global shutdown drains every pool and is idempotent.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;
use tracing::info;

use crate::pool::{PoolConfig, PoolError, VmWorkerPool};
use crate::profile::{CapabilityProfile, PoolKey};
use crate::rpc::CallIds;
use crate::runner::{VmConfig, VmRunner};

/// Owner of every pool in the process.
pub struct PoolManager {
    runner: Arc<dyn VmRunner>,
    base_vm_config: VmConfig,
    pool_config: PoolConfig,
    call_ids: CallIds,
    pools: RwLock<HashMap<PoolKey, Arc<VmWorkerPool>>>,
    shutdown: AtomicBool,
}

impl PoolManager {
    /// Manager creating pools on `runner` with the given defaults.
    #[must_use]
    pub fn new(runner: Arc<dyn VmRunner>, base_vm_config: VmConfig, pool_config: PoolConfig) -> Self {
        Self {
            runner,
            base_vm_config,
            pool_config,
            call_ids: CallIds::new(),
            pools: RwLock::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Shared call-id allocator for every stream under this manager.
    #[must_use]
    pub fn call_ids(&self) -> CallIds {
        self.call_ids.clone()
    }

    /// The pool for `profile`, constructing it on first use.
    ///
    /// Idempotent under concurrency: the first caller constructs, every
    /// concurrent caller observes the same instance.
    ///
    /// # Errors
    ///
    /// [`PoolError::Shutdown`] once the manager is draining.
    pub async fn get_or_create(
        &self,
        profile: &CapabilityProfile,
    ) -> Result<Arc<VmWorkerPool>, PoolError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(PoolError::Shutdown);
        }

        let key = profile.pool_key();
        if let Some(pool) = self.pools.read().await.get(&key) {
            return Ok(Arc::clone(pool));
        }

        let mut pools = self.pools.write().await;
        // Double-check: another task may have created the pool while we
        // waited for the write lock.
        if let Some(pool) = pools.get(&key) {
            return Ok(Arc::clone(pool));
        }
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(PoolError::Shutdown);
        }

        info!(pool = %key.short(), "creating pool");
        let pool = VmWorkerPool::new(
            profile.clone(),
            &self.base_vm_config,
            self.pool_config.clone(),
            Arc::clone(&self.runner),
            self.call_ids.clone(),
        );
        pools.insert(key, Arc::clone(&pool));
        Ok(pool)
    }

    /// Number of live pools.
    pub async fn pool_count(&self) -> usize {
        self.pools.read().await.len()
    }

    /// Drain every pool: fail queued waiters, kill warm VMs, drop
    /// snapshots. New acquisitions fail with [`PoolError::Shutdown`].
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let pools: Vec<_> = self.pools.write().await.drain().collect();
        info!(pools = pools.len(), "pool manager shutting down");
        for (_, pool) in pools {
            pool.shutdown().await;
        }
    }
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("shutdown", &self.shutdown.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
