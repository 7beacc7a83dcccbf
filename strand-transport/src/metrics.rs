//! Counters sampled from and incremented by the reactor pool.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time connection counts of one reactor, sampled on its own thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReactorMetrics {
    /// Outbound connections currently tracked, negotiating ones included.
    pub num_client_connections: usize,
    /// Inbound connections currently tracked, negotiating ones included.
    pub num_server_connections: usize,
}

impl ReactorMetrics {
    #[must_use]
    pub fn merged(self, other: Self) -> Self {
        Self {
            num_client_connections: self.num_client_connections + other.num_client_connections,
            num_server_connections: self.num_server_connections + other.num_server_connections,
        }
    }
}

/// Messenger-wide monotonic counters, shared across reactor threads.
#[derive(Debug, Default)]
pub struct MessengerMetrics {
    connections_accepted: AtomicU64,
    tasks_aborted: AtomicU64,
}

impl MessengerMetrics {
    pub(crate) fn record_connection_accepted(&self) {
        let _ = self.connections_accepted.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_task_aborted(&self) {
        let _ = self.tasks_aborted.fetch_add(1, Ordering::AcqRel);
    }

    /// Total inbound sockets handed to a reactor since startup.
    #[must_use]
    pub fn connections_accepted(&self) -> u64 {
        self.connections_accepted.load(Ordering::Acquire)
    }

    /// Total reactor tasks aborted instead of run.
    #[must_use]
    pub fn tasks_aborted(&self) -> u64 {
        self.tasks_aborted.load(Ordering::Acquire)
    }
}
