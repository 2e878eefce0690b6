//! Shared helpers for the integration suites.

#![allow(dead_code)] // Each suite uses its own subset.

use std::sync::Arc;
use std::time::Duration;

use firebreak_core::codec::Value;
use firebreak_core::executor::{FunctionRegistry, RemoteFailure};
use firebreak_core::pool::PoolConfig;
use firebreak_core::profile::CapabilityProfile;
use firebreak_core::runner::VmConfig;
use firebreak_core::runner::mock::MockRunner;
use firebreak_core::sandbox::SandboxManager;

/// Registry with the functions the scenarios call.
pub fn test_registry() -> Arc<FunctionRegistry> {
    let registry = Arc::new(FunctionRegistry::new());

    registry.register("m:double", |args, _kwargs| {
        let n = args
            .first()
            .and_then(Value::as_int)
            .ok_or_else(|| RemoteFailure::new("TypeError", "expected an integer"))?;
        Ok(Value::Int(n * 2))
    });

    registry.register("m:sleep_ms", |args, _kwargs| {
        let ms = args.first().and_then(Value::as_int).unwrap_or(0);
        std::thread::sleep(Duration::from_millis(u64::try_from(ms).unwrap_or(0)));
        Ok(Value::Null)
    });

    registry.register("m:boom", |_args, _kwargs| {
        Err(RemoteFailure::new("ValueError", "bad"))
    });

    registry
}

/// Pool sizing with test-friendly cadences.
pub fn fast_pool_config(min_size: usize, max_size: usize) -> PoolConfig {
    PoolConfig {
        min_size,
        max_size,
        maintenance_interval: Duration::from_millis(20),
        install_timeout: Duration::from_secs(5),
        ..PoolConfig::default()
    }
}

/// Manager over a mock runner with the standard test registry.
pub fn manager_with(runner: Arc<MockRunner>, pool_config: PoolConfig) -> SandboxManager {
    SandboxManager::new(runner, VmConfig::default(), pool_config)
}

/// Profile without dependencies.
pub fn plain_profile(cpu_ms: u32) -> CapabilityProfile {
    CapabilityProfile::builder().cpu_ms(cpu_ms).build().unwrap()
}

/// Positional arguments.
pub fn args(values: impl IntoIterator<Item = Value>) -> Value {
    Value::seq(values)
}

/// No keyword arguments.
pub fn no_kwargs() -> Value {
    Value::Map(Vec::new())
}

/// Poll `cond` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
