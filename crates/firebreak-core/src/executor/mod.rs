//! In-guest executor: function registry and serve loop.
//!
//! The guest side of every stream runs this loop: read one framed
//! request, resolve the target function by its stable identifier,
//! execute it under a soft timer, and write back either the encoded
//! result or a serialized failure. User failures are data, not control
//! flow; the loop itself only exits when the stream closes or the wire
//! contract is violated, and a violation closes the stream so the host
//! observes a crash.
//!
//! The same loop backs both real guests (the `firebreak-guest` daemon)
//! and the mock runner's in-memory guests, which keeps the host-visible
//! contract identical across backends.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::codec::{self, Value};
use crate::rpc::{self, FrameCodec, RpcError, RpcRequest, RpcResponse};

/// Failure kind reported when the guest soft timer expires.
///
/// The host treats this kind as a timeout rather than a user failure:
/// the timed-out function is still running on its thread, so the VM
/// cannot be reused.
pub const GUEST_TIMEOUT_KIND: &str = "TimeoutError";

/// A failure raised by a guest function, carried back to the host as
/// data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFailure {
    /// Original failure type name, e.g. `ValueError`.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Textual guest-side trace.
    pub trace: String,
}

impl RemoteFailure {
    /// Failure with a synthesized single-entry trace.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        let kind = kind.into();
        let message = message.into();
        let trace = format!("remote trace (most recent call last):\n  {kind}: {message}\n");
        Self {
            kind,
            message,
            trace,
        }
    }

    /// Failure with an explicit trace.
    pub fn with_trace(
        kind: impl Into<String>,
        message: impl Into<String>,
        trace: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: trace.into(),
        }
    }
}

/// Signature of a registered guest function.
pub type Handler =
    dyn Fn(Vec<Value>, Vec<(String, Value)>) -> Result<Value, RemoteFailure> + Send + Sync;

/// Maps stable function identifiers (`module:qualname`) to handlers.
#[derive(Default)]
pub struct FunctionRegistry {
    funcs: RwLock<HashMap<String, Arc<Handler>>>,
}

impl FunctionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `function_ref`, replacing any previous
    /// registration.
    pub fn register<F>(&self, function_ref: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>, Vec<(String, Value)>) -> Result<Value, RemoteFailure>
            + Send
            + Sync
            + 'static,
    {
        self.funcs
            .write()
            .insert(function_ref.into(), Arc::new(handler));
    }

    /// Look up a handler.
    #[must_use]
    pub fn resolve(&self, function_ref: &str) -> Option<Arc<Handler>> {
        self.funcs.read().get(function_ref).cloned()
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.funcs.read().len())
            .finish()
    }
}

/// Dependency installation seam.
///
/// The real guest shells out to a package manager; the mock guest
/// records the set so snapshots can capture it.
#[async_trait]
pub trait Installer: Send + Sync {
    /// Install the given package specifiers.
    async fn install(&self, dependencies: &[String]) -> Result<(), RemoteFailure>;
}

/// Everything one guest connection needs to serve requests.
#[derive(Clone)]
pub struct ExecutorHost {
    /// Function registry shared by all connections.
    pub registry: Arc<FunctionRegistry>,
    /// Installation backend for provisioning requests.
    pub installer: Arc<dyn Installer>,
}

impl ExecutorHost {
    /// Bundle a registry and an installer.
    #[must_use]
    pub fn new(registry: Arc<FunctionRegistry>, installer: Arc<dyn Installer>) -> Self {
        Self {
            registry,
            installer,
        }
    }
}

impl std::fmt::Debug for ExecutorHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorHost")
            .field("registry", &self.registry)
            .finish()
    }
}

/// Serve one guest stream until it closes.
///
/// Writes the readiness handshake first, then loops over framed
/// requests. Returns `Ok(())` on a clean peer close.
///
/// # Errors
///
/// Returns the underlying [`RpcError`] when the stream fails or the
/// host violates the wire contract; the caller should drop the stream,
/// which the host observes as a crash.
pub async fn serve<S>(stream: S, host: ExecutorHost) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = stream;
    rpc::write_handshake(&mut stream).await?;
    let mut framed = Framed::new(stream, FrameCodec::new());

    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let request = RpcRequest::decode(&frame)?;
        let response = handle_request(request, &host).await;
        framed.send(response.encode()).await?;
    }
    debug!("guest stream closed by host");
    Ok(())
}

async fn handle_request(request: RpcRequest, host: &ExecutorHost) -> RpcResponse {
    match request {
        RpcRequest::Install {
            call_id,
            dependencies,
        } => match host.installer.install(&dependencies).await {
            Ok(()) => RpcResponse::Ok {
                call_id,
                result: encoded_null(),
            },
            Err(failure) => {
                warn!(error = %failure.message, "dependency install failed");
                failure_response(call_id, failure)
            },
        },
        RpcRequest::Call {
            call_id,
            function_ref,
            args,
            kwargs,
            deadline_ms,
        } => match run_call(host, &function_ref, &args, &kwargs, deadline_ms).await {
            Ok(result) => RpcResponse::Ok { call_id, result },
            Err(failure) => failure_response(call_id, failure),
        },
    }
}

async fn run_call(
    host: &ExecutorHost,
    function_ref: &str,
    args: &Bytes,
    kwargs: &Bytes,
    deadline_ms: u32,
) -> Result<Bytes, RemoteFailure> {
    let handler = host.registry.resolve(function_ref).ok_or_else(|| {
        RemoteFailure::new(
            "ImportError",
            format!("cannot resolve function '{function_ref}'"),
        )
    })?;

    let args = decode_args(args)?;
    let kwargs = decode_kwargs(kwargs)?;

    debug!(function_ref, deadline_ms, "executing call");
    let invocation = tokio::task::spawn_blocking(move || (*handler)(args, kwargs));
    let soft_timer = std::time::Duration::from_millis(u64::from(deadline_ms));

    let joined = match tokio::time::timeout(soft_timer, invocation).await {
        Err(_) => {
            return Err(RemoteFailure::new(
                GUEST_TIMEOUT_KIND,
                format!("function execution exceeded {deadline_ms}ms"),
            ));
        },
        Ok(joined) => joined,
    };

    let outcome = match joined {
        Ok(outcome) => outcome,
        Err(join_error) if join_error.is_panic() => {
            return Err(RemoteFailure::new("Panic", "function panicked"));
        },
        Err(_) => {
            return Err(RemoteFailure::new("Cancelled", "function task cancelled"));
        },
    };

    let value = outcome?;
    codec::encode(&value).map(Bytes::from).map_err(|e| {
        RemoteFailure::new("EncodeError", format!("result not encodable: {e}"))
    })
}

fn decode_args(args: &Bytes) -> Result<Vec<Value>, RemoteFailure> {
    match codec::decode(args) {
        Ok(Value::Seq(items)) => Ok(items),
        Ok(_) => Err(RemoteFailure::new(
            "DecodeError",
            "positional arguments must be a sequence",
        )),
        Err(e) => Err(RemoteFailure::new(
            "DecodeError",
            format!("cannot decode arguments: {e}"),
        )),
    }
}

fn decode_kwargs(kwargs: &Bytes) -> Result<Vec<(String, Value)>, RemoteFailure> {
    match codec::decode(kwargs) {
        Ok(Value::Map(entries)) => Ok(entries),
        Ok(_) => Err(RemoteFailure::new(
            "DecodeError",
            "keyword arguments must be a mapping",
        )),
        Err(e) => Err(RemoteFailure::new(
            "DecodeError",
            format!("cannot decode keyword arguments: {e}"),
        )),
    }
}

fn failure_response(call_id: u64, failure: RemoteFailure) -> RpcResponse {
    RpcResponse::Err {
        call_id,
        kind: failure.kind,
        message: failure.message,
        remote_trace: failure.trace,
    }
}

fn encoded_null() -> Bytes {
    // Encoding a null cannot exceed any codec limit.
    Bytes::from(codec::encode(&Value::Null).unwrap_or_default())
}
