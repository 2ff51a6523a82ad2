//! The error-code taxonomy.
//!
//! Every boundary of the engine resolves into one of these codes; no panic
//! or foreign error type crosses the public API. The same codes double as
//! link-termination reasons (a link closed normally terminates with
//! `Success`).

use serde::{Deserialize, Serialize};

/// Outcome of an operation execution, an IQ exchange, or a link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum ErrorCode {
    /// Completed; no further action.
    #[error("success")]
    Success,
    /// In flight; a response is awaited.
    #[error("queued")]
    Queued,
    /// The underlying descriptor or operation no longer exists.
    #[error("expired")]
    Expired,
    /// Malformed IQ or violated invariant.
    #[error("bad request")]
    BadRequest,
    /// The peer's negotiated version cannot handle the request.
    #[error("feature not supported by peer")]
    FeatureNotSupportedByPeer,
    /// The peer rejected the connection attempt; retry soon.
    #[error("busy")]
    Busy,
    /// The link dropped; retry soon.
    #[error("disconnected")]
    Disconnected,
    /// No response in time; retry soon.
    #[error("timeout")]
    Timeout,
    /// The transport could not reach the peer; retry with backoff.
    #[error("connectivity error")]
    ConnectivityError,
    /// The peer no longer authorizes us.
    #[error("not authorized")]
    NotAuthorized,
    /// The relationship was revoked.
    #[error("revoked")]
    Revoked,
    /// The peer identity is gone.
    #[error("gone")]
    Gone,
    /// Cryptographic failure on the link.
    #[error("crypto error")]
    CryptoError,
    /// The persistence layer failed; surfaced, never self-repaired.
    #[error("database error")]
    DatabaseError,
}

impl ErrorCode {
    /// Transient codes keep the operation queued and advance backoff by one
    /// slot.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Busy | Self::Disconnected | Self::Timeout | Self::ConnectivityError
        )
    }

    /// Fatal codes jump backoff to the maximum slot; the operation stays
    /// queued until trust is re-established.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::NotAuthorized | Self::Revoked | Self::Gone | Self::CryptoError
        )
    }

    /// Terminal codes delete the operation without retrying.
    pub fn is_terminal_for_operation(self) -> bool {
        matches!(
            self,
            Self::Expired | Self::BadRequest | Self::FeatureNotSupportedByPeer
        )
    }

    /// Codes that reset the per-conversation backoff to slot zero when a
    /// link terminates with them.
    pub fn resets_backoff(self) -> bool {
        matches!(self, Self::Success | Self::Busy | Self::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ErrorCode::Busy.is_transient());
        assert!(ErrorCode::ConnectivityError.is_transient());
        assert!(!ErrorCode::Gone.is_transient());
        assert!(!ErrorCode::Success.is_transient());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ErrorCode::Gone.is_fatal());
        assert!(ErrorCode::Revoked.is_fatal());
        assert!(ErrorCode::NotAuthorized.is_fatal());
        assert!(ErrorCode::CryptoError.is_fatal());
        assert!(!ErrorCode::Timeout.is_fatal());
    }

    #[test]
    fn test_terminal_classification() {
        assert!(ErrorCode::Expired.is_terminal_for_operation());
        assert!(ErrorCode::BadRequest.is_terminal_for_operation());
        assert!(ErrorCode::FeatureNotSupportedByPeer.is_terminal_for_operation());
        assert!(!ErrorCode::Queued.is_terminal_for_operation());
    }

    #[test]
    fn test_backoff_reset_codes() {
        assert!(ErrorCode::Success.resets_backoff());
        assert!(ErrorCode::Busy.resets_backoff());
        assert!(!ErrorCode::ConnectivityError.resets_backoff());
        assert!(!ErrorCode::Gone.resets_backoff());
    }
}
