//! Outbound and inbound call handles.
//!
//! An [`OutboundCall`] is created on a caller thread, crosses into a reactor
//! through the task queue, and is completed exactly once: either with a
//! response payload read off the wire or with a terminal error. Completion is
//! delivered through a channel so the caller can wait synchronously without
//! sharing any call state with the reactor thread.

use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use strand_common::error::{RpcError, RpcResult};
use strand_common::ids::CallId;

use crate::connection::ConnectionId;

/// Caller-supplied policy for one outbound call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallController {
    timeout: Option<Duration>,
}

impl CallController {
    #[must_use]
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    /// Deadline budget for the call. `None` means the caller accepts waiting
    /// forever; the reactor logs a warning when it sees that.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// One outbound RPC, owned by whichever stage is currently responsible for it.
#[derive(Debug)]
pub struct OutboundCall {
    conn_id: ConnectionId,
    method: String,
    payload: Vec<u8>,
    controller: CallController,
    reply: Sender<RpcResult<Vec<u8>>>,
}

impl OutboundCall {
    /// Creates a call plus the receiver its terminal status is delivered on.
    #[must_use]
    pub fn new(
        conn_id: ConnectionId,
        method: impl Into<String>,
        payload: Vec<u8>,
        controller: CallController,
    ) -> (Self, CallReceiver) {
        let (reply, receiver) = mpsc::channel();
        let call = Self {
            conn_id,
            method: method.into(),
            payload,
            controller,
            reply,
        };
        (call, CallReceiver { receiver })
    }

    #[must_use]
    pub fn conn_id(&self) -> &ConnectionId {
        &self.conn_id
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[must_use]
    pub fn controller(&self) -> CallController {
        self.controller
    }

    /// Completes the call with a terminal error. Consuming `self` makes a
    /// second completion unrepresentable.
    pub(crate) fn fail(self, status: RpcError) {
        let _ = self.reply.send(Err(status));
    }

    /// Completes the call with the response payload read off the wire.
    pub(crate) fn respond(self, payload: Vec<u8>) {
        let _ = self.reply.send(Ok(payload));
    }
}

/// Caller-side handle awaiting one call's completion.
#[derive(Debug)]
pub struct CallReceiver {
    receiver: Receiver<RpcResult<Vec<u8>>>,
}

impl CallReceiver {
    /// Blocks until the call completes.
    ///
    /// # Errors
    ///
    /// Returns the call's terminal error, or `RpcError::ServiceUnavailable` if
    /// the transport dropped the call without completing it (a reactor thread
    /// death backstop; the normal shutdown paths always complete calls).
    pub fn wait(self) -> RpcResult<Vec<u8>> {
        self.receiver.recv().unwrap_or_else(|_| {
            Err(RpcError::ServiceUnavailable(
                "call was dropped before completion".to_owned(),
            ))
        })
    }

    /// Blocks until the call completes or `wait_limit` elapses.
    ///
    /// # Errors
    ///
    /// As [`CallReceiver::wait`], plus `RpcError::TimedOut` when the local
    /// wait limit is reached before the transport completes the call.
    pub fn wait_timeout(self, wait_limit: Duration) -> RpcResult<Vec<u8>> {
        match self.receiver.recv_timeout(wait_limit) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(RpcError::TimedOut(
                "no call completion before the wait limit".to_owned(),
            )),
            Err(RecvTimeoutError::Disconnected) => Err(RpcError::ServiceUnavailable(
                "call was dropped before completion".to_owned(),
            )),
        }
    }
}

/// One inbound RPC handed from a reactor to the service dispatch seam.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundCall {
    /// Wire call id; echoed back in the response frame.
    pub call_id: CallId,
    /// Requested service method.
    pub method: String,
    /// Opaque request payload.
    pub payload: Vec<u8>,
    /// Peer address of the connection the call arrived on.
    pub remote: SocketAddr,
}
