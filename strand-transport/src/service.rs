//! Seam between the reactor pool and whatever executes inbound calls.
//!
//! The reactors never run user service code; they hand each decoded request
//! through [`InboundDispatch`] and move on. Rejections travel back to the
//! caller as error responses on the wire.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use strand_common::error::{RpcError, RpcResult};

use crate::call::InboundCall;

/// Accepts inbound calls on a reactor thread. Implementations must return
/// quickly; anything slow belongs on the implementor's own threads.
pub trait InboundDispatch: Send + Sync {
    /// Takes ownership of one inbound call.
    ///
    /// # Errors
    ///
    /// Returns an error to reject the call; the reactor reports it to the
    /// remote caller and keeps the connection open.
    fn dispatch(&self, call: InboundCall) -> RpcResult<()>;
}

/// Dispatch for client-only messengers: accepts and drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardingDispatch;

impl InboundDispatch for DiscardingDispatch {
    fn dispatch(&self, _call: InboundCall) -> RpcResult<()> {
        Ok(())
    }
}

/// Reference dispatch: a bounded FIFO a service worker pool drains.
///
/// Overflow is rejected with the backpressure status callers and tests match
/// on by substring.
#[derive(Debug)]
pub struct BoundedServiceQueue {
    capacity: usize,
    queue: Mutex<VecDeque<InboundCall>>,
}

impl BoundedServiceQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Removes the oldest queued call, if any.
    #[must_use]
    pub fn pop(&self) -> Option<InboundCall> {
        self.lock_queue().pop_front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_queue().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock_queue().is_empty()
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<InboundCall>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl InboundDispatch for BoundedServiceQueue {
    fn dispatch(&self, call: InboundCall) -> RpcResult<()> {
        let mut queue = self.lock_queue();
        if queue.len() >= self.capacity {
            return Err(RpcError::ServiceUnavailable(
                "service queue is full".to_owned(),
            ));
        }
        queue.push_back(call);
        Ok(())
    }
}
