//! Error types for lease keepalive operations.
//!
//! Callers branch on these variants to tell an unreachable coordinator apart
//! from a renewal loop that broke underneath them, and from misuse of a lease
//! that is no longer valid.

use thiserror::Error;

use crate::models::{Lease, LeaseId};

/// Top-level error type for the lease-keepalive crate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeepaliveError {
    /// A grant, renew or revoke call could not be issued or did not complete
    /// within the request timeout.
    #[error("coordinator unavailable: {0}")]
    CoordinatorUnavailable(String),

    /// An active keepalive session ended for a reason outside caller control.
    #[error("keepalive for lease {lease} interrupted: {reason}")]
    KeepaliveInterrupted { lease: LeaseId, reason: String },

    /// Operation attempted on a canceled, released or expired lease.
    #[error("invalid lease: {0}")]
    InvalidLease(LeaseId),

    /// Raw transport fault reported by a coordinator implementation.
    ///
    /// Sessions never hand this to callers directly, it is folded into
    /// [`KeepaliveError::KeepaliveInterrupted`].
    #[error("transport error: {0}")]
    Transport(String),

    /// Invalid argument or configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl KeepaliveError {
    /// Returns true if a keepalive session was interrupted.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, KeepaliveError::KeepaliveInterrupted { .. })
    }

    /// Returns true if the coordinator could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, KeepaliveError::CoordinatorUnavailable(_))
    }

    /// Returns true if the lease is no longer usable.
    pub fn is_invalid_lease(&self) -> bool {
        matches!(self, KeepaliveError::InvalidLease(_))
    }

    /// Fold any error raised while a session is active into an interruption of
    /// `lease`.
    pub(crate) fn into_interruption(self, lease: LeaseId) -> KeepaliveError {
        match self {
            err @ KeepaliveError::KeepaliveInterrupted { .. } => err,
            KeepaliveError::InvalidLease(id) => KeepaliveError::KeepaliveInterrupted {
                lease,
                reason: format!("lease {id} expired or revoked by coordinator"),
            },
            KeepaliveError::Transport(reason)
            | KeepaliveError::CoordinatorUnavailable(reason)
            | KeepaliveError::Config(reason) => {
                KeepaliveError::KeepaliveInterrupted { lease, reason }
            }
        }
    }
}

/// Shorthand result alias for keepalive operations.
pub type KeepaliveResult<T> = Result<T, KeepaliveError>;

/// A keepalive session could not be started. Hands the lease back so the
/// caller can retry or release it.
#[derive(Debug, Error)]
#[error("keepalive for lease {} not started: {error}", .lease.id())]
pub struct StartError {
    error: KeepaliveError,
    lease: Lease,
}

impl StartError {
    pub(crate) fn new(error: KeepaliveError, lease: Lease) -> Self {
        Self { error, lease }
    }

    pub fn error(&self) -> &KeepaliveError {
        &self.error
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub fn into_lease(self) -> Lease {
        self.lease
    }

    pub fn into_parts(self) -> (KeepaliveError, Lease) {
        (self.error, self.lease)
    }
}

impl From<StartError> for KeepaliveError {
    fn from(err: StartError) -> Self {
        err.error
    }
}
