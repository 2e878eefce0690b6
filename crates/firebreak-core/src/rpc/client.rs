//! The host-side RPC client.
//!
//! One client wraps one guest stream. Calls are strictly serialized:
//! a request frame is written, then exactly one response frame is read
//! under the caller's deadline and cancellation signal. Any framing or
//! ordering violation poisons the stream; the pool reacts by tainting
//! the VM that owns it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{FrameCodec, RpcError, RpcRequest, RpcResponse};

/// Process-wide monotonic call-id allocator.
///
/// Ids are unique across every stream the manager drives, which makes a
/// mismatched response attributable in logs.
#[derive(Debug, Default, Clone)]
pub struct CallIds(Arc<AtomicU64>);

impl CallIds {
    /// New allocator starting at 1.
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(1)))
    }

    /// Next unused call id.
    #[must_use]
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Framed request/response client over one guest stream.
#[derive(Debug)]
pub struct RpcClient<S> {
    framed: Framed<S, FrameCodec>,
}

impl<S> RpcClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a stream that has already completed the readiness handshake.
    pub fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, FrameCodec::new()),
        }
    }

    /// Perform one call: write the request, read the matching response.
    ///
    /// The deadline is authoritative on the host side; expiry aborts the
    /// read and the VM owning this stream must be tainted, because an
    /// in-flight response could still arrive later and desynchronize the
    /// stream. Cancellation has the same effect.
    ///
    /// # Errors
    ///
    /// [`RpcError::Timeout`] on deadline expiry, [`RpcError::Cancelled`]
    /// on cancellation, [`RpcError::RemoteCrash`] when the guest closes
    /// the stream between frames, and [`RpcError::Protocol`] on call-id
    /// mismatches or malformed frames.
    pub async fn call(
        &mut self,
        request: &RpcRequest,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<RpcResponse, RpcError> {
        let call_id = request.call_id();
        self.framed.send(request.encode()).await?;

        let response = tokio::select! {
            () = cancel.cancelled() => return Err(RpcError::Cancelled),
            read = tokio::time::timeout_at(deadline, self.framed.next()) => match read {
                Err(_) => return Err(RpcError::Timeout),
                Ok(None) => return Err(RpcError::RemoteCrash),
                Ok(Some(Err(e))) => return Err(e),
                Ok(Some(Ok(frame))) => RpcResponse::decode(&frame)?,
            },
        };

        if response.call_id() != call_id {
            return Err(RpcError::Protocol {
                reason: format!(
                    "response call id {} does not match request {call_id}",
                    response.call_id()
                ),
            });
        }
        debug!(call_id, "rpc call completed");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use std::time::Duration;

    use super::*;
    use crate::rpc;

    /// Serve exactly one scripted response on the guest side.
    async fn respond_once(stream: tokio::io::DuplexStream, response: Option<RpcResponse>) {
        let mut framed = Framed::new(stream, FrameCodec::new());
        let frame = framed.next().await.unwrap().unwrap();
        let request = RpcRequest::decode(&frame).unwrap();
        if let Some(mut response) = response {
            if let RpcResponse::Ok { call_id, .. } | RpcResponse::Err { call_id, .. } =
                &mut response
            {
                if *call_id == 0 {
                    *call_id = request.call_id();
                }
            }
            framed.send(response.encode()).await.unwrap();
        }
    }

    fn call_request(call_id: u64) -> RpcRequest {
        RpcRequest::Call {
            call_id,
            function_ref: "m:f".to_string(),
            args: Bytes::new(),
            kwargs: Bytes::new(),
            deadline_ms: 100,
        }
    }

    fn in_ms(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[tokio::test]
    async fn test_call_receives_matching_response() {
        let (host, guest) = tokio::io::duplex(4096);
        let server = tokio::spawn(respond_once(
            guest,
            Some(RpcResponse::Ok {
                call_id: 0,
                result: Bytes::from_static(b"\x00"),
            }),
        ));

        let mut client = RpcClient::new(host);
        let response = client
            .call(&call_request(9), in_ms(200), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.call_id(), 9);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_mismatched_call_id_is_protocol_error() {
        let (host, guest) = tokio::io::duplex(4096);
        tokio::spawn(respond_once(
            guest,
            Some(RpcResponse::Ok {
                call_id: 999,
                result: Bytes::new(),
            }),
        ));

        let mut client = RpcClient::new(host);
        let err = client
            .call(&call_request(9), in_ms(200), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_deadline_expiry_is_timeout() {
        let (host, _guest_kept_open) = tokio::io::duplex(4096);
        let mut client = RpcClient::new(host);
        let err = client
            .call(&call_request(1), in_ms(30), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout));
    }

    #[tokio::test]
    async fn test_eof_between_frames_is_remote_crash() {
        let (host, guest) = tokio::io::duplex(4096);
        tokio::spawn(respond_once(guest, None));

        let mut client = RpcClient::new(host);
        let err = client
            .call(&call_request(1), in_ms(200), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::RemoteCrash));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_read() {
        let (host, _guest_kept_open) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();
        let mut client = RpcClient::new(host);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = client
            .call(&call_request(1), in_ms(5_000), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Cancelled));
    }

    #[tokio::test]
    async fn test_malformed_response_is_protocol_error() {
        let (host, guest) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut framed = Framed::new(guest, FrameCodec::new());
            let _ = framed.next().await;
            framed.send(Bytes::from_static(&[0x55])).await.unwrap();
        });

        let mut client = RpcClient::new(host);
        let err = client
            .call(&call_request(1), in_ms(200), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Protocol { .. }));
    }

    #[test]
    fn test_call_ids_are_monotonic() {
        let ids = rpc::CallIds::new();
        let first = ids.next();
        let second = ids.next();
        assert!(second > first);
    }
}
