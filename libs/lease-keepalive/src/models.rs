//! Lease, renewal and session-state models.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::error::{KeepaliveError, KeepaliveResult};

// ---------------------------------------------------------------------------
// Lease identifier
// ---------------------------------------------------------------------------

/// Opaque lease token issued by the coordinator.
///
/// Displayed in hex, the way etcd tooling prints lease ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseId(i64);

impl LeaseId {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for LeaseId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// A time-bounded grant held by this process.
///
/// Not `Clone`: starting a keepalive session or releasing the lease consumes
/// it, so a lease can drive at most one renewal loop.
#[derive(Debug, PartialEq, Eq)]
pub struct Lease {
    id: LeaseId,
    ttl: Duration,
    granted_at: DateTime<Utc>,
    granted: Instant,
}

impl Lease {
    pub(crate) fn new(id: LeaseId, ttl: Duration) -> Self {
        Self {
            id,
            ttl,
            granted_at: Utc::now(),
            granted: Instant::now(),
        }
    }

    pub fn id(&self) -> LeaseId {
        self.id
    }

    /// Nominal time-to-live granted by the coordinator.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Wall-clock time the grant was received.
    pub fn granted_at(&self) -> DateTime<Utc> {
        self.granted_at
    }

    /// Nominal expiry assuming no renewal happened since the grant.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.granted_at + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX)
    }

    /// True once the nominal TTL has elapsed since the grant.
    pub fn is_expired(&self) -> bool {
        self.granted.elapsed() >= self.ttl
    }
}

// ---------------------------------------------------------------------------
// Renewal event
// ---------------------------------------------------------------------------

/// Confirmation that a renewal succeeded, as delivered to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalEvent {
    /// Lease that was renewed.
    pub lease_id: LeaseId,
    /// Remaining time-to-live reported by the coordinator.
    pub ttl: Duration,
    /// Position of this event within its session, starting at 1.
    pub seq: u64,
    /// Local receive timestamp.
    pub received_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Keepalive lifecycle: `Idle -> Acquiring -> Active -> {Canceled | Interrupted}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeepaliveState {
    Idle,
    Acquiring,
    Active,
    Canceled,
    Interrupted,
}

impl KeepaliveState {
    /// Returns true for the two final states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, KeepaliveState::Canceled | KeepaliveState::Interrupted)
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn advance(self, next: KeepaliveState) -> KeepaliveResult<KeepaliveState> {
        use KeepaliveState::*;
        match (self, next) {
            (Idle, Acquiring)
            | (Acquiring, Idle)
            | (Acquiring, Active)
            | (Active, Canceled)
            | (Active, Interrupted) => Ok(next),
            (from, to) => Err(KeepaliveError::Config(format!(
                "invalid keepalive state transition {from} -> {to}"
            ))),
        }
    }
}

impl std::fmt::Display for KeepaliveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeepaliveState::Idle => write!(f, "idle"),
            KeepaliveState::Acquiring => write!(f, "acquiring"),
            KeepaliveState::Active => write!(f, "active"),
            KeepaliveState::Canceled => write!(f, "canceled"),
            KeepaliveState::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Why a keepalive session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The caller canceled or abandoned the session.
    Canceled,
    /// The renewal stream broke; always a `KeepaliveInterrupted` error.
    Interrupted(KeepaliveError),
}

impl Termination {
    pub fn is_voluntary(&self) -> bool {
        matches!(self, Termination::Canceled)
    }

    pub(crate) fn state(&self) -> KeepaliveState {
        match self {
            Termination::Canceled => KeepaliveState::Canceled,
            Termination::Interrupted(_) => KeepaliveState::Interrupted,
        }
    }
}
