//! Reactor-core RPC transport.
//!
//! A messenger owns a pool of single-threaded reactor event loops. Each reactor
//! owns a disjoint set of TCP connections, drives their negotiation → ready →
//! shutdown lifecycle, and is fed work from other threads exclusively through a
//! task queue paired with a poll wakeup. Connection negotiation blocks, so it
//! runs on a shared worker pool and re-enters the owning reactor through the
//! same task queue.

pub mod call;
pub mod connection;
pub mod frame;
pub mod messenger;
pub mod metrics;
pub mod negotiation;
pub mod reactor;
pub mod service;

pub use call::{CallController, CallReceiver, InboundCall, OutboundCall};
pub use connection::{ConnectionDirection, ConnectionId, UserCredentials};
pub use messenger::Messenger;
pub use metrics::{MessengerMetrics, ReactorMetrics};
pub use negotiation::{ConnectionNegotiator, NegotiatedContext, PlainNegotiator};
pub use reactor::Reactor;
pub use service::{BoundedServiceQueue, DiscardingDispatch, InboundDispatch};
