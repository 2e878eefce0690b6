//! # firebreak-core
//!
//! Control plane for function-level sandboxing on warm micro VMs.
//!
//! A declared capability profile (filesystem mounts, network policy,
//! call budget, memory ceiling, preinstalled packages) is canonicalized
//! into a content-addressed pool key. Each key owns a pool of pre-booted
//! VMs; pools with dependencies are provisioned once and every further
//! VM is restored from the captured snapshot. Calls are dispatched over
//! a framed host↔guest stream with faithful remote-failure propagation.
//! Isolation comes from the VM boundary, not from the host process.
//!
//! ## Modules
//!
//! - [`profile`]: capability profiles, canonicalization, pool keys
//! - [`codec`]: the tagged binary value codec for arguments and results
//! - [`rpc`]: framing, wire envelopes, and the call client
//! - [`executor`]: the in-guest serve loop and function registry
//! - [`runner`]: VM backends (Firecracker and an in-memory mock)
//! - [`pool`]: per-profile warm pools with recycling and maintenance
//! - [`manager`]: the key-to-pool table
//! - [`sandbox`]: the top-level dispatcher
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use firebreak_core::codec::Value;
//! use firebreak_core::executor::FunctionRegistry;
//! use firebreak_core::pool::PoolConfig;
//! use firebreak_core::profile::CapabilityProfile;
//! use firebreak_core::runner::VmConfig;
//! use firebreak_core::runner::mock::MockRunner;
//! use firebreak_core::sandbox::SandboxManager;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(FunctionRegistry::new());
//! registry.register("m:double", |args, _kwargs| {
//!     Ok(Value::Int(args[0].as_int().unwrap_or(0) * 2))
//! });
//!
//! let runner = Arc::new(MockRunner::new(registry));
//! let manager = SandboxManager::new(runner, VmConfig::default(), PoolConfig::default());
//!
//! let profile = CapabilityProfile::builder().cpu_ms(200).build()?;
//! let result = manager
//!     .execute("m:double", Value::seq([Value::Int(3)]), Value::Map(Vec::new()), &profile)
//!     .await?;
//! assert_eq!(result, Value::Int(6));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod codec;
pub mod config;
pub mod error;
pub mod executor;
pub mod manager;
pub mod pool;
pub mod profile;
pub mod rpc;
pub mod runner;
pub mod sandbox;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::codec::Value;
    pub use crate::config::FirebreakConfig;
    pub use crate::error::SandboxError;
    pub use crate::pool::PoolConfig;
    pub use crate::profile::{CapabilityProfile, FsMount, MountMode, NetworkPolicy, PoolKey};
    pub use crate::runner::{VmConfig, VmRunner};
    pub use crate::sandbox::SandboxManager;
}

pub use config::FirebreakConfig;
pub use error::SandboxError;
pub use profile::{CapabilityProfile, PoolKey};
pub use sandbox::SandboxManager;
