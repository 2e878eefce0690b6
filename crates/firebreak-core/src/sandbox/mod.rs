//! The top-level sandbox manager.
//!
//! [`SandboxManager::execute`] is the whole call path in one place:
//! encode the arguments, pick the profile's pool, borrow a warm VM,
//! dispatch the framed call, translate the outcome, and hand the VM
//! back with a verdict the pool can act on.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::{self, Value};
use crate::error::SandboxError;
use crate::executor;
use crate::manager::PoolManager;
use crate::pool::{CallOutcome, PoolConfig};
use crate::profile::CapabilityProfile;
use crate::rpc::{RpcError, RpcRequest, RpcResponse};
use crate::runner::{VmConfig, VmRunner};

/// Top-level dispatcher for sandboxed calls.
pub struct SandboxManager {
    pools: PoolManager,
}

impl SandboxManager {
    /// Manager dispatching onto `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn VmRunner>, base_vm_config: VmConfig, pool_config: PoolConfig) -> Self {
        Self {
            pools: PoolManager::new(runner, base_vm_config, pool_config),
        }
    }

    /// The underlying pool manager, for introspection.
    #[must_use]
    pub const fn pools(&self) -> &PoolManager {
        &self.pools
    }

    /// Execute `function_ref` in a sandbox matching `profile`.
    ///
    /// `args` must be a [`Value::Seq`] and `kwargs` a [`Value::Map`].
    ///
    /// # Errors
    ///
    /// Any [`SandboxError`]; see the taxonomy for VM side effects.
    pub async fn execute(
        &self,
        function_ref: &str,
        args: Value,
        kwargs: Value,
        profile: &CapabilityProfile,
    ) -> Result<Value, SandboxError> {
        self.execute_cancellable(function_ref, args, kwargs, profile, &CancellationToken::new())
            .await
    }

    /// Like [`Self::execute`], interruptible through `cancel`.
    ///
    /// Cancellation while queued for a VM has no side effects;
    /// cancellation mid-call taints the VM like a timeout would.
    ///
    /// # Errors
    ///
    /// Any [`SandboxError`]; see the taxonomy for VM side effects.
    pub async fn execute_cancellable(
        &self,
        function_ref: &str,
        args: Value,
        kwargs: Value,
        profile: &CapabilityProfile,
        cancel: &CancellationToken,
    ) -> Result<Value, SandboxError> {
        let (args, kwargs) = encode_arguments(args, kwargs)?;

        let pool = self.pools.get_or_create(profile).await?;
        let config = pool.config();
        let cpu_budget = Duration::from_millis(u64::from(profile.cpu_ms));

        let acquire_deadline = Instant::now() + cpu_budget + config.pool_wait_slack;
        let mut vm = pool.acquire(acquire_deadline, cancel).await?;
        debug!(function_ref, vm = %vm.id, pool = %pool.key().short(), "dispatching call");

        let request = RpcRequest::Call {
            call_id: self.pools.call_ids().next(),
            function_ref: function_ref.to_string(),
            args,
            kwargs,
            deadline_ms: profile.cpu_ms,
        };
        let call_deadline = Instant::now() + cpu_budget + config.network_grace;
        let response = vm.client.call(&request, call_deadline, cancel).await;

        match response {
            Ok(RpcResponse::Ok { result, .. }) => match codec::decode(&result) {
                Ok(value) => {
                    pool.release(vm, CallOutcome::Ok);
                    Ok(value)
                },
                Err(e) => {
                    pool.release(vm, CallOutcome::Protocol);
                    Err(SandboxError::ProtocolError {
                        reason: format!("undecodable result: {e}"),
                    })
                },
            },
            Ok(RpcResponse::Err {
                kind,
                message,
                remote_trace,
                ..
            }) => {
                // The guest soft timer fires before the host deadline.
                // The timed-out function still occupies its thread in
                // the guest, so the VM is tainted like a host timeout.
                if kind == executor::GUEST_TIMEOUT_KIND {
                    pool.release(vm, CallOutcome::Timeout);
                    return Err(SandboxError::Timeout {
                        cpu_ms: profile.cpu_ms,
                    });
                }
                // Any other guest-raised failure is data; the stream
                // stayed in lockstep and the VM remains warm.
                pool.release(vm, CallOutcome::Ok);
                Err(SandboxError::RemoteException {
                    kind,
                    message,
                    remote_trace,
                })
            },
            Err(RpcError::Timeout) => {
                pool.release(vm, CallOutcome::Timeout);
                Err(SandboxError::Timeout {
                    cpu_ms: profile.cpu_ms,
                })
            },
            Err(RpcError::Cancelled) => {
                pool.release(vm, CallOutcome::Cancelled);
                Err(SandboxError::Cancelled)
            },
            Err(RpcError::RemoteCrash | RpcError::Io(_)) => {
                pool.release(vm, CallOutcome::RemoteCrash);
                Err(SandboxError::RemoteCrash)
            },
            Err(e @ (RpcError::Protocol { .. } | RpcError::FrameTooLarge { .. })) => {
                pool.release(vm, CallOutcome::Protocol);
                Err(SandboxError::ProtocolError {
                    reason: e.to_string(),
                })
            },
        }
    }

    /// Drain every pool. Idempotent; subsequent calls fail with
    /// [`SandboxError::Shutdown`].
    pub async fn shutdown(&self) {
        self.pools.shutdown().await;
    }
}

impl std::fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxManager")
            .field("pools", &self.pools)
            .finish()
    }
}

/// Validate argument shapes and encode them, before any VM is involved.
fn encode_arguments(args: Value, kwargs: Value) -> Result<(Bytes, Bytes), SandboxError> {
    if !matches!(args, Value::Seq(_)) {
        return Err(SandboxError::UnencodableArgument {
            reason: "positional arguments must be a sequence".to_string(),
        });
    }
    if !matches!(kwargs, Value::Map(_)) {
        return Err(SandboxError::UnencodableArgument {
            reason: "keyword arguments must be a mapping".to_string(),
        });
    }
    let args = Bytes::from(codec::encode(&args)?);
    let kwargs = Bytes::from(codec::encode(&kwargs)?);
    Ok((args, kwargs))
}
