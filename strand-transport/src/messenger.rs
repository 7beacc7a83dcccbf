//! The messenger: a named pool of reactors plus the shared negotiation pool.
//!
//! Callers hold one messenger per process role (client, server, or both) and
//! talk to it from any thread. Work lands on a reactor chosen by a stable hash
//! of the remote address; nothing fancier than that is promised.

use std::hash::{Hash, Hasher};
use std::net::{SocketAddr, TcpStream as StdTcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use strand_common::config::MessengerConfig;
use strand_common::error::{RpcError, RpcResult};
use strand_common::ids::ReactorIndex;

use crate::call::OutboundCall;
use crate::metrics::{MessengerMetrics, ReactorMetrics};
use crate::negotiation::{ConnectionNegotiator, NegotiationPool};
use crate::reactor::Reactor;
use crate::service::InboundDispatch;

pub struct Messenger {
    name: String,
    reactors: Vec<Reactor>,
    negotiation_pool: Arc<NegotiationPool>,
    metrics: Arc<MessengerMetrics>,
    closing: AtomicBool,
}

impl Messenger {
    /// Builds the negotiation pool and spins up the reactor threads.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::InvalidConfig` for an empty messenger name and
    /// `RpcError::Io` when a reactor cannot be started.
    pub fn start(
        config: &MessengerConfig,
        dispatch: Arc<dyn InboundDispatch>,
        negotiator: Arc<dyn ConnectionNegotiator>,
    ) -> RpcResult<Self> {
        if config.name.is_empty() {
            return Err(RpcError::InvalidConfig("messenger name must not be empty"));
        }
        let name = config.name.clone();
        let metrics = Arc::new(MessengerMetrics::default());
        let negotiation_pool = Arc::new(NegotiationPool::new(
            config.normalized_negotiation_pool_size(),
            negotiator,
        ));

        let reactor_count = config.normalized_reactor_count();
        let mut reactors = Vec::with_capacity(reactor_count);
        for index in 0..reactor_count {
            reactors.push(Reactor::start(
                format!("{name}_R{index:03}"),
                config,
                Arc::clone(&negotiation_pool),
                Arc::clone(&dispatch),
                Arc::clone(&metrics),
            )?);
        }

        Ok(Self {
            name,
            reactors,
            negotiation_pool,
            metrics,
            closing: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn reactor_count(&self) -> usize {
        self.reactors.len()
    }

    /// Messenger-wide monotonic counters.
    #[must_use]
    pub fn metrics(&self) -> &MessengerMetrics {
        &self.metrics
    }

    /// Routes an outbound call to the reactor owning its remote.
    pub fn queue_outbound_call(&self, call: OutboundCall) {
        self.reactor_for_remote(call.conn_id().remote)
            .queue_outbound_call(call);
    }

    /// Adopts a socket accepted by an acceptor thread.
    pub fn register_inbound_socket(&self, socket: StdTcpStream, remote: SocketAddr) {
        self.metrics.record_connection_accepted();
        self.reactor_for_remote(remote)
            .register_inbound_socket(socket, remote);
    }

    /// Sums connection counts across all reactors.
    ///
    /// # Errors
    ///
    /// Returns the shutdown status once any reactor is closing.
    pub fn get_metrics(&self) -> RpcResult<ReactorMetrics> {
        let mut total = ReactorMetrics::default();
        for reactor in &self.reactors {
            total = total.merged(reactor.get_metrics()?);
        }
        Ok(total)
    }

    /// Tears the messenger down: the negotiation pool first, so racing
    /// connection starts observe the pool-closed status instead of hanging,
    /// then every reactor. Idempotent.
    pub fn shutdown(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(messenger = %self.name, "shutting down messenger");
        self.negotiation_pool.stop();
        for reactor in &self.reactors {
            reactor.shutdown();
        }
    }

    fn reactor_for_remote(&self, remote: SocketAddr) -> &Reactor {
        let index = reactor_index_for_remote(remote, self.reactors.len());
        &self.reactors[index]
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Stable peer-hash placement: one remote always lands on the same reactor of
/// a given messenger, which is what keeps the one-connection-per-id invariant
/// messenger-wide.
fn reactor_index_for_remote(remote: SocketAddr, reactor_count: usize) -> ReactorIndex {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    remote.hash(&mut hasher);
    let bucket = usize::try_from(hasher.finish()).unwrap_or_default();
    bucket % reactor_count.max(1)
}

#[cfg(test)]
mod tests {
    use super::reactor_index_for_remote;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::net::SocketAddr;

    #[rstest]
    fn remote_hash_placement_is_stable_and_in_range() {
        let remote = SocketAddr::from(([10, 1, 2, 3], 7051));
        let first = reactor_index_for_remote(remote, 4);
        let second = reactor_index_for_remote(remote, 4);

        assert_that!(first, eq(second));
        assert_that!(first < 4, eq(true));
    }

    #[rstest]
    fn zero_reactor_count_does_not_divide_by_zero() {
        let remote = SocketAddr::from(([127, 0, 0, 1], 1));
        assert_that!(reactor_index_for_remote(remote, 0), eq(0_usize));
    }
}
