//! Runtime configuration consumed by messenger bootstrap code.

use std::time::Duration;

const DEFAULT_REACTOR_COUNT: usize = 4;
const DEFAULT_NEGOTIATION_POOL_SIZE: usize = 4;
const DEFAULT_CONNECTION_KEEPALIVE: Duration = Duration::from_secs(65);
const DEFAULT_COARSE_TIMER_GRANULARITY: Duration = Duration::from_millis(100);
const DEFAULT_SERVER_NEGOTIATION_TIMEOUT_MS: u64 = 3000;
const MIN_COARSE_TIMER_GRANULARITY: Duration = Duration::from_millis(1);

/// Messenger-wide configuration fixed at construction.
///
/// Degenerate values are tolerated and clamped through the `normalized_*`
/// accessors rather than rejected, so a partially filled struct update stays
/// usable in tests and bootstrap code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessengerConfig {
    /// Human-readable messenger name, used as the prefix of reactor thread names.
    pub name: String,
    /// Number of reactor event-loop threads.
    pub reactor_count: usize,
    /// Number of blocking negotiation worker threads shared by all reactors.
    pub negotiation_pool_size: usize,
    /// Maximum idle duration before an inbound connection is reaped.
    pub connection_keepalive_time: Duration,
    /// Period of the coarse reactor timer that drives idle scans and call expiry.
    pub coarse_timer_granularity: Duration,
    /// Deadline granted to a newly accepted connection to finish negotiation.
    pub server_negotiation_timeout_ms: u64,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            name: "rpc".to_owned(),
            reactor_count: DEFAULT_REACTOR_COUNT,
            negotiation_pool_size: DEFAULT_NEGOTIATION_POOL_SIZE,
            connection_keepalive_time: DEFAULT_CONNECTION_KEEPALIVE,
            coarse_timer_granularity: DEFAULT_COARSE_TIMER_GRANULARITY,
            server_negotiation_timeout_ms: DEFAULT_SERVER_NEGOTIATION_TIMEOUT_MS,
        }
    }
}

impl MessengerConfig {
    #[must_use]
    pub fn normalized_reactor_count(&self) -> usize {
        self.reactor_count.max(1)
    }

    #[must_use]
    pub fn normalized_negotiation_pool_size(&self) -> usize {
        self.negotiation_pool_size.max(1)
    }

    #[must_use]
    pub fn normalized_coarse_timer_granularity(&self) -> Duration {
        self.coarse_timer_granularity.max(MIN_COARSE_TIMER_GRANULARITY)
    }

    #[must_use]
    pub fn normalized_connection_keepalive_time(&self) -> Duration {
        self.connection_keepalive_time
            .max(self.normalized_coarse_timer_granularity())
    }

    #[must_use]
    pub fn server_negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.server_negotiation_timeout_ms.max(1))
    }
}
