//! Host↔guest RPC: framing, wire envelopes, and the call client.
//!
//! The transport is a reliable ordered byte stream between the host and
//! one guest. Every message is a length-prefixed frame (see [`framing`]);
//! inside a frame sits one tagged envelope: a [`RpcRequest`] from the
//! host or a [`RpcResponse`] from the guest. Exactly one call is in
//! flight per stream; parallelism comes from using more VMs, never from
//! multiplexing one stream.
//!
//! Before any frame is exchanged the guest writes a single
//! [`HANDSHAKE_BYTE`] on the raw stream; the runner treats a VM as booted
//! only once that byte has been read.

pub mod client;
pub mod framing;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

pub use client::{CallIds, RpcClient};
pub use framing::{FrameCodec, MAX_FRAME_SIZE};

/// Byte written by the guest executor once its listener is ready.
pub const HANDSHAKE_BYTE: u8 = 0xFB;

const REQ_TAG_CALL: u8 = 0x01;
const REQ_TAG_INSTALL: u8 = 0x02;
const RESP_TAG_OK: u8 = 0x81;
const RESP_TAG_ERR: u8 = 0x82;

/// RPC failures observed by the host.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// A frame exceeded the negotiated size cap.
    #[error("frame of {size} bytes exceeds the {max} byte cap")]
    FrameTooLarge {
        /// Observed frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// The peer violated the wire contract.
    #[error("protocol error: {reason}")]
    Protocol {
        /// What was violated.
        reason: String,
    },

    /// The host-side deadline expired.
    #[error("call deadline expired")]
    Timeout,

    /// The caller cancelled the call.
    #[error("call cancelled")]
    Cancelled,

    /// The guest closed the stream between frames.
    #[error("guest stream closed unexpectedly")]
    RemoteCrash,

    /// Transport I/O failure.
    #[error("stream I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RpcError {
    fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }
}

/// One stream endpoint to a guest.
///
/// Tagged variants rather than a trait object: the two transports the
/// runners produce are a vsock-backed Unix socket (real hypervisor) and
/// an in-memory duplex pipe (mock backend).
#[derive(Debug)]
pub enum GuestChannel {
    /// Unix domain socket, as exposed by the hypervisor's vsock mux.
    Unix(tokio::net::UnixStream),
    /// In-memory duplex stream from the mock runner.
    Duplex(tokio::io::DuplexStream),
}

impl AsyncRead for GuestChannel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Self::Duplex(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for GuestChannel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
            Self::Duplex(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_flush(cx),
            Self::Duplex(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Self::Duplex(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Write the readiness handshake on a fresh guest-side stream.
///
/// # Errors
///
/// Propagates stream I/O failures.
pub async fn write_handshake<S>(stream: &mut S) -> Result<(), RpcError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&[HANDSHAKE_BYTE]).await?;
    stream.flush().await?;
    Ok(())
}

/// Read and verify the readiness handshake on a fresh host-side stream.
///
/// # Errors
///
/// Returns [`RpcError::Protocol`] on a wrong byte and
/// [`RpcError::RemoteCrash`] if the stream closes first.
pub async fn read_handshake<S>(stream: &mut S) -> Result<(), RpcError>
where
    S: AsyncRead + Unpin,
{
    let mut byte = [0u8; 1];
    match stream.read_exact(&mut byte).await {
        Ok(_) => {},
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(RpcError::RemoteCrash);
        },
        Err(e) => return Err(e.into()),
    }
    if byte[0] != HANDSHAKE_BYTE {
        return Err(RpcError::protocol(format!(
            "unexpected handshake byte 0x{:02x}",
            byte[0]
        )));
    }
    Ok(())
}

/// A host-to-guest request envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcRequest {
    /// Invoke a function resolved by its stable identifier.
    Call {
        /// Monotonic per-stream call identifier.
        call_id: u64,
        /// Stable function identifier, `module:qualname`.
        function_ref: String,
        /// Codec-encoded positional arguments (a sequence).
        args: Bytes,
        /// Codec-encoded keyword arguments (a mapping).
        kwargs: Bytes,
        /// Guest-side soft timer in milliseconds.
        deadline_ms: u32,
    },
    /// Install the dependency set during pool provisioning.
    Install {
        /// Monotonic per-stream call identifier.
        call_id: u64,
        /// Normalized package specifiers.
        dependencies: Vec<String>,
    },
}

impl RpcRequest {
    /// The envelope's call identifier.
    #[must_use]
    pub const fn call_id(&self) -> u64 {
        match self {
            Self::Call { call_id, .. } | Self::Install { call_id, .. } => *call_id,
        }
    }

    /// Serialize into one frame payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        match self {
            Self::Call {
                call_id,
                function_ref,
                args,
                kwargs,
                deadline_ms,
            } => {
                buf.put_u8(REQ_TAG_CALL);
                buf.put_u64(*call_id);
                put_chunk(&mut buf, function_ref.as_bytes());
                put_chunk(&mut buf, args);
                put_chunk(&mut buf, kwargs);
                buf.put_u32(*deadline_ms);
            },
            Self::Install {
                call_id,
                dependencies,
            } => {
                buf.put_u8(REQ_TAG_INSTALL);
                buf.put_u64(*call_id);
                buf.put_u32(dependencies.len() as u32);
                for dep in dependencies {
                    put_chunk(&mut buf, dep.as_bytes());
                }
            },
        }
        buf.freeze()
    }

    /// Deserialize from one frame payload.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Protocol`] on unknown tags, truncation, or
    /// non-UTF-8 identifiers.
    pub fn decode(frame: &Bytes) -> Result<Self, RpcError> {
        let mut buf = frame.clone();
        let tag = take_u8(&mut buf)?;
        let request = match tag {
            REQ_TAG_CALL => {
                let call_id = take_u64(&mut buf)?;
                let function_ref = take_string(&mut buf)?;
                let args = take_chunk(&mut buf)?;
                let kwargs = take_chunk(&mut buf)?;
                let deadline_ms = take_u32(&mut buf)?;
                Self::Call {
                    call_id,
                    function_ref,
                    args,
                    kwargs,
                    deadline_ms,
                }
            },
            REQ_TAG_INSTALL => {
                let call_id = take_u64(&mut buf)?;
                let count = take_u32(&mut buf)? as usize;
                let mut dependencies = Vec::with_capacity(count.min(1_024));
                for _ in 0..count {
                    dependencies.push(take_string(&mut buf)?);
                }
                Self::Install {
                    call_id,
                    dependencies,
                }
            },
            other => {
                return Err(RpcError::protocol(format!(
                    "unknown request tag 0x{other:02x}"
                )));
            },
        };
        ensure_empty(&buf)?;
        Ok(request)
    }
}

/// A guest-to-host response envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcResponse {
    /// The call completed and produced a result.
    Ok {
        /// Echoed call identifier.
        call_id: u64,
        /// Codec-encoded result value.
        result: Bytes,
    },
    /// The call raised a failure inside the guest.
    Err {
        /// Echoed call identifier.
        call_id: u64,
        /// Original failure type name.
        kind: String,
        /// Failure message.
        message: String,
        /// Textual guest-side trace.
        remote_trace: String,
    },
}

impl RpcResponse {
    /// The envelope's call identifier.
    #[must_use]
    pub const fn call_id(&self) -> u64 {
        match self {
            Self::Ok { call_id, .. } | Self::Err { call_id, .. } => *call_id,
        }
    }

    /// Serialize into one frame payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        match self {
            Self::Ok { call_id, result } => {
                buf.put_u8(RESP_TAG_OK);
                buf.put_u64(*call_id);
                put_chunk(&mut buf, result);
            },
            Self::Err {
                call_id,
                kind,
                message,
                remote_trace,
            } => {
                buf.put_u8(RESP_TAG_ERR);
                buf.put_u64(*call_id);
                put_chunk(&mut buf, kind.as_bytes());
                put_chunk(&mut buf, message.as_bytes());
                put_chunk(&mut buf, remote_trace.as_bytes());
            },
        }
        buf.freeze()
    }

    /// Deserialize from one frame payload.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Protocol`] on unknown tags, truncation, or
    /// non-UTF-8 text fields.
    pub fn decode(frame: &Bytes) -> Result<Self, RpcError> {
        let mut buf = frame.clone();
        let tag = take_u8(&mut buf)?;
        let response = match tag {
            RESP_TAG_OK => Self::Ok {
                call_id: take_u64(&mut buf)?,
                result: take_chunk(&mut buf)?,
            },
            RESP_TAG_ERR => Self::Err {
                call_id: take_u64(&mut buf)?,
                kind: take_string(&mut buf)?,
                message: take_string(&mut buf)?,
                remote_trace: take_string(&mut buf)?,
            },
            other => {
                return Err(RpcError::protocol(format!(
                    "unknown response tag 0x{other:02x}"
                )));
            },
        };
        ensure_empty(&buf)?;
        Ok(response)
    }
}

fn put_chunk(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn take_u8(buf: &mut Bytes) -> Result<u8, RpcError> {
    if buf.remaining() < 1 {
        return Err(RpcError::protocol("truncated envelope"));
    }
    Ok(buf.get_u8())
}

fn take_u32(buf: &mut Bytes) -> Result<u32, RpcError> {
    if buf.remaining() < 4 {
        return Err(RpcError::protocol("truncated envelope"));
    }
    Ok(buf.get_u32())
}

fn take_u64(buf: &mut Bytes) -> Result<u64, RpcError> {
    if buf.remaining() < 8 {
        return Err(RpcError::protocol("truncated envelope"));
    }
    Ok(buf.get_u64())
}

fn take_chunk(buf: &mut Bytes) -> Result<Bytes, RpcError> {
    let len = take_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(RpcError::protocol("truncated envelope"));
    }
    Ok(buf.split_to(len))
}

fn take_string(buf: &mut Bytes) -> Result<String, RpcError> {
    let chunk = take_chunk(buf)?;
    String::from_utf8(chunk.to_vec())
        .map_err(|_| RpcError::protocol("envelope text field is not valid UTF-8"))
}

fn ensure_empty(buf: &Bytes) -> Result<(), RpcError> {
    if buf.has_remaining() {
        return Err(RpcError::protocol(format!(
            "{} trailing bytes in envelope",
            buf.remaining()
        )));
    }
    Ok(())
}
