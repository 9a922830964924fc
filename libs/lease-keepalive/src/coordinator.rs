//! Abstract coordinator interface.
//!
//! `Coordinator` is the seam between the keepalive manager and whatever
//! service actually stores and expires leases. The manager only needs grant,
//! a streaming renew, revoke and a put bound to a lease.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::KeepaliveResult;
use crate::models::LeaseId;

/// Lower bound on the interval between two keepalive requests.
pub const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(500);

/// Interval between keepalive requests for a lease granted `ttl`: a third of
/// the TTL, so two requests can be lost before the lease expires.
pub fn renew_interval(ttl: Duration) -> Duration {
    (ttl / 3).max(MIN_RENEW_INTERVAL)
}

/// TTL a coordinator grants for a request of `ttl`: whole seconds, rounded
/// up, at least one.
pub fn whole_seconds(ttl: Duration) -> Duration {
    let secs = ttl.as_secs().saturating_add(u64::from(ttl.subsec_nanos() > 0));
    Duration::from_secs(secs.max(1))
}

/// A lease as granted by the coordinator, before the manager takes ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    pub id: LeaseId,
    /// TTL actually granted; the coordinator may round or raise the request.
    pub ttl: Duration,
}

/// A single renewal confirmation pushed by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalAck {
    pub id: LeaseId,
    /// Remaining TTL in seconds. Zero or negative means the lease is gone.
    pub ttl_secs: i64,
}

impl RenewalAck {
    pub fn new(id: LeaseId, ttl_secs: i64) -> Self {
        Self { id, ttl_secs }
    }

    /// Returns true if the coordinator reports the lease as expired.
    pub fn is_expired(&self) -> bool {
        self.ttl_secs <= 0
    }
}

/// Open renewal stream for one lease.
///
/// Dropping the stream closes it.
#[async_trait]
pub trait RenewalStream: Send + std::fmt::Debug {
    /// Wait for the next confirmation.
    ///
    /// `Ok(None)` means the coordinator closed the stream, `Err` is a
    /// transport fault. Either way the stream is finished.
    async fn next_renewal(&mut self) -> KeepaliveResult<Option<RenewalAck>>;
}

/// Remote lease coordinator.
#[async_trait]
pub trait Coordinator: Send + Sync + std::fmt::Debug + 'static {
    /// Request a new lease with the given nominal TTL.
    async fn grant(&self, ttl: Duration) -> KeepaliveResult<LeaseGrant>;

    /// Open the renewal stream for `id`.
    async fn keep_alive(&self, id: LeaseId) -> KeepaliveResult<Box<dyn RenewalStream>>;

    /// Revoke `id`, deleting any keys bound to it.
    async fn revoke(&self, id: LeaseId) -> KeepaliveResult<()>;

    /// Write `key = value` tied to lease `id`.
    async fn put_with_lease(&self, id: LeaseId, key: &str, value: &str) -> KeepaliveResult<()>;
}
