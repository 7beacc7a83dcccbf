//! Shared error model for cross-crate APIs.

use thiserror::Error;

/// Unified result type used by all public interfaces in `strand-rpc`.
pub type RpcResult<T> = Result<T, RpcError>;

/// Domain-level error categories surfaced by the transport.
///
/// Several callers match on the rendered text rather than the variant, so the
/// `Display` prefixes below are part of the public contract and must not change.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The target (reactor, negotiation pool, or service queue) cannot take new work.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Socket-level failure: connect failure, reset, idle timeout, EOF.
    #[error("Network error: {0}")]
    Network(String),

    /// A deadline elapsed before the operation completed.
    #[error("Timed out: {0}")]
    TimedOut(String),

    /// Internal invariant violation. Always logged before it is surfaced.
    #[error("Illegal state: {0}")]
    IllegalState(&'static str),

    /// Configuration is invalid for the requested operation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Host I/O failed outside of socket traffic (fd mode switches, spawn failures).
    #[error("IO error: {0}")]
    Io(String),
}

impl RpcError {
    /// Prefixes the error message with caller context, keeping the variant.
    /// Variants carrying static messages pass through unchanged.
    #[must_use]
    pub fn prepend(self, context: &str) -> Self {
        match self {
            Self::ServiceUnavailable(message) => {
                Self::ServiceUnavailable(format!("{context}: {message}"))
            }
            Self::Network(message) => Self::Network(format!("{context}: {message}")),
            Self::TimedOut(message) => Self::TimedOut(format!("{context}: {message}")),
            Self::Io(message) => Self::Io(format!("{context}: {message}")),
            other @ (Self::IllegalState(_) | Self::InvalidConfig(_)) => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RpcError;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(RpcError::ServiceUnavailable("reactor is shutting down".to_owned()), "Service unavailable: reactor is shutting down")]
    #[case(RpcError::Network("got EOF from remote".to_owned()), "Network error: got EOF from remote")]
    #[case(RpcError::IllegalState("negotiation pool is shutting down"), "Illegal state: negotiation pool is shutting down")]
    fn display_prefixes_are_stable(#[case] error: RpcError, #[case] rendered: &str) {
        assert_that!(format!("{error}"), eq(rendered));
    }

    #[rstest]
    fn prepend_keeps_the_variant_and_prefixes_the_message() {
        let error = RpcError::Io("spawn failed".to_owned())
            .prepend("Unable to start connection negotiation thread");
        assert_that!(
            format!("{error}"),
            eq("IO error: Unable to start connection negotiation thread: spawn failed")
        );

        let passthrough = RpcError::IllegalState("negotiation pool is shutting down")
            .prepend("context");
        assert_that!(
            passthrough,
            eq(&RpcError::IllegalState("negotiation pool is shutting down"))
        );
    }
}
