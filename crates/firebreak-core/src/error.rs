//! The sandbox failure taxonomy.
//!
//! Everything a caller can observe from `execute` is one of these
//! variants. Guest-raised failures arrive as data, carrying the original
//! type name, the message, and a textual trace; the host never
//! rematerializes a guest failure type. Equality of `kind` strings is
//! the contract.

use crate::codec::CodecError;
use crate::pool::PoolError;

/// Failures surfaced by the sandbox manager.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SandboxError {
    /// An argument or return value lies outside the codec space.
    /// The pool is never touched.
    #[error("unencodable argument: {reason}")]
    UnencodableArgument {
        /// Why the value was rejected.
        reason: String,
    },

    /// No VM could be acquired within the deadline.
    #[error("no vm available within the acquisition deadline")]
    PoolExhausted,

    /// Dependency installation or snapshotting failed; the profile's
    /// pool fails fast until the manager is rebuilt.
    #[error("provisioning failed: {reason}")]
    ProvisioningError {
        /// What went wrong during provisioning.
        reason: String,
    },

    /// The call budget elapsed. The VM is tainted.
    #[error("call exceeded its {cpu_ms}ms budget")]
    Timeout {
        /// The budget that elapsed.
        cpu_ms: u32,
    },

    /// Framing or call ordering was violated. The VM is tainted.
    #[error("protocol error: {reason}")]
    ProtocolError {
        /// What was violated.
        reason: String,
    },

    /// The guest stream closed unexpectedly. The VM is tainted.
    #[error("guest crashed")]
    RemoteCrash,

    /// The caller cancelled. The VM is tainted only if the RPC was in
    /// flight.
    #[error("call cancelled")]
    Cancelled,

    /// The sandboxed function raised. The VM stays warm.
    #[error("remote exception [{kind}] {message}")]
    RemoteException {
        /// Original failure type name.
        kind: String,
        /// Failure message.
        message: String,
        /// Textual guest-side trace.
        remote_trace: String,
    },

    /// The manager is draining.
    #[error("sandbox manager is shut down")]
    Shutdown,
}

impl From<CodecError> for SandboxError {
    fn from(e: CodecError) -> Self {
        Self::UnencodableArgument {
            reason: e.to_string(),
        }
    }
}

impl From<PoolError> for SandboxError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Exhausted => Self::PoolExhausted,
            PoolError::Provisioning(reason) => Self::ProvisioningError { reason },
            PoolError::Shutdown => Self::Shutdown,
            PoolError::Cancelled => Self::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_error_translation() {
        assert!(matches!(
            SandboxError::from(PoolError::Exhausted),
            SandboxError::PoolExhausted
        ));
        assert!(matches!(
            SandboxError::from(PoolError::Provisioning("install failed".into())),
            SandboxError::ProvisioningError { .. }
        ));
        assert!(matches!(
            SandboxError::from(PoolError::Shutdown),
            SandboxError::Shutdown
        ));
    }

    #[test]
    fn test_display_carries_kind_and_message() {
        let err = SandboxError::RemoteException {
            kind: "ValueError".into(),
            message: "bad".into(),
            remote_trace: "trace".into(),
        };
        assert_eq!(err.to_string(), "remote exception [ValueError] bad");
    }
}
