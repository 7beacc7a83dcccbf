//! Canonical identifier types used across the transport crates.

/// Per-connection monotonic call identifier carried in every wire frame.
pub type CallId = u64;

/// Index of a reactor inside its messenger's pool.
pub type ReactorIndex = usize;

/// First call id handed out by a fresh connection; zero is reserved so it can
/// mark frames that are not tied to a call.
pub const FIRST_CALL_ID: CallId = 1;
