//! Error taxonomy for the Huddle core.
//!
//! Nothing here is retried automatically and no error is fatal to the
//! process; a failure on one connection never affects others.

use crate::store::StoreError;
use huddle_protocol::events::error_code;
use huddle_protocol::UserId;
use thiserror::Error;

/// Core errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Operation attempted on a connection that has not identified.
    #[error("connection is not bound to an identity")]
    AuthRequired,

    /// Receiver or callee identity unknown or unavailable.
    #[error("unknown or unavailable target user: {0}")]
    InvalidTarget(UserId),

    /// A non-terminal call session for this pair already exists.
    #[error("a call with user {0} is already in progress")]
    AlreadyInProgress(UserId),

    /// Signaling event inconsistent with the session state or sender role.
    #[error("signaling event not valid for the current session state")]
    SessionStateViolation,

    /// Signal for a session that no longer exists. Routine under races
    /// (late ICE candidates after hangup); dropped, never surfaced.
    #[error("signal for a session that no longer exists")]
    StaleSignal,

    /// The message store rejected the operation.
    #[error("message store failure: {0}")]
    Persistence(#[from] StoreError),
}

impl CoreError {
    /// Wire error code for errors that are surfaced to clients.
    ///
    /// Returns `None` for [`CoreError::StaleSignal`], which is silently
    /// dropped rather than reported.
    #[must_use]
    pub fn wire_code(&self) -> Option<u16> {
        match self {
            CoreError::AuthRequired => Some(error_code::AUTH_REQUIRED),
            CoreError::InvalidTarget(_) => Some(error_code::INVALID_TARGET),
            CoreError::AlreadyInProgress(_) => Some(error_code::ALREADY_IN_PROGRESS),
            CoreError::SessionStateViolation => Some(error_code::SESSION_STATE_VIOLATION),
            CoreError::StaleSignal => None,
            CoreError::Persistence(_) => Some(error_code::PERSISTENCE_FAILURE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_signal_has_no_wire_code() {
        assert_eq!(CoreError::StaleSignal.wire_code(), None);
        assert_eq!(
            CoreError::AuthRequired.wire_code(),
            Some(error_code::AUTH_REQUIRED)
        );
    }
}
