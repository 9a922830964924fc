//! Lease keepalive manager.
//!
//! Grants leases from a [`Coordinator`], starts one renewal session per lease
//! and releases leases. Every remote call is bounded by the configured request
//! timeout and reported as `CoordinatorUnavailable` when it cannot complete;
//! nothing is retried here since a blind retry of a grant can leak a second
//! lease. Retry policy belongs to the caller.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use config::SessionConfig;

use crate::coordinator::Coordinator;
use crate::error::{KeepaliveError, KeepaliveResult, StartError};
use crate::metrics;
use crate::models::{Lease, LeaseId};
use crate::session::KeepaliveSession;

/// Smallest TTL a coordinator will grant.
pub const MIN_TTL: Duration = Duration::from_secs(1);

/// Client-side lease lifecycle manager.
#[derive(Debug, Clone)]
pub struct KeepaliveManager {
    coordinator: Arc<dyn Coordinator>,
    config: SessionConfig,
    active: Arc<AtomicUsize>,
}

impl KeepaliveManager {
    pub fn new(coordinator: Arc<dyn Coordinator>) -> Self {
        Self::with_config(coordinator, SessionConfig::default())
    }

    pub fn with_config(coordinator: Arc<dyn Coordinator>, config: SessionConfig) -> Self {
        Self {
            coordinator,
            config,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Number of renewal loops still running.
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    async fn bounded<T, F>(&self, op: &str, fut: F) -> KeepaliveResult<T>
    where
        F: Future<Output = KeepaliveResult<T>>,
    {
        match tokio::time::timeout(self.config.request_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(KeepaliveError::Transport(reason))) => Err(
                KeepaliveError::CoordinatorUnavailable(format!("{op} failed: {reason}")),
            ),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(KeepaliveError::CoordinatorUnavailable(format!(
                "{op} timed out after {:?}",
                self.config.request_timeout
            ))),
        }
    }

    /// Request a new lease with nominal time-to-live `ttl`.
    pub async fn acquire(&self, ttl: Duration) -> KeepaliveResult<Lease> {
        if ttl < MIN_TTL {
            return Err(KeepaliveError::Config(format!(
                "lease ttl must be at least {MIN_TTL:?}, got {ttl:?}"
            )));
        }

        debug!(?ttl, "requesting lease grant");

        match self.bounded("lease grant", self.coordinator.grant(ttl)).await {
            Ok(grant) => {
                metrics::LEASES_GRANTED.inc();
                info!(lease = %grant.id, ttl = ?grant.ttl, "lease granted");
                Ok(Lease::new(grant.id, grant.ttl))
            }
            Err(err) => {
                metrics::GRANT_FAILURES.inc();
                warn!(%err, "lease grant failed");
                Err(err)
            }
        }
    }

    /// Begin renewing `lease`.
    ///
    /// The returned session produces renewal events until it is canceled or
    /// the renewal stream breaks. On failure the lease is handed back inside
    /// the error.
    pub async fn start_keepalive(&self, lease: Lease) -> Result<KeepaliveSession, StartError> {
        if lease.is_expired() {
            warn!(lease = %lease.id(), "refusing keepalive on expired lease");
            return Err(StartError::new(KeepaliveError::InvalidLease(lease.id()), lease));
        }

        let stream = match self
            .bounded("keepalive open", self.coordinator.keep_alive(lease.id()))
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                warn!(lease = %lease.id(), %err, "failed to open renewal stream");
                return Err(StartError::new(err, lease));
            }
        };
        info!(lease = %lease.id(), ttl = ?lease.ttl(), "keepalive started");

        Ok(KeepaliveSession::spawn(
            lease,
            stream,
            self.config.channel_capacity,
            Arc::clone(&self.active),
        ))
    }

    /// Bind `key = value` to `lease` so it disappears with the lease.
    pub async fn attach_key(&self, lease: &Lease, key: &str, value: &str) -> KeepaliveResult<()> {
        if lease.is_expired() {
            return Err(KeepaliveError::InvalidLease(lease.id()));
        }
        self.bounded(
            "put with lease",
            self.coordinator.put_with_lease(lease.id(), key, value),
        )
        .await?;
        debug!(lease = %lease.id(), key, "key bound to lease");
        Ok(())
    }

    /// Revoke a lease that has no session.
    pub async fn release(&self, lease: Lease) -> KeepaliveResult<()> {
        self.revoke(lease.id()).await
    }

    /// Cancel `session`, then revoke its lease.
    pub async fn release_session(&self, session: KeepaliveSession) -> KeepaliveResult<()> {
        let lease = session.into_lease().await;
        self.revoke(lease.id()).await
    }

    async fn revoke(&self, id: LeaseId) -> KeepaliveResult<()> {
        self.bounded("lease revoke", self.coordinator.revoke(id))
            .await?;
        metrics::LEASES_REVOKED.inc();
        info!(lease = %id, "lease revoked");
        Ok(())
    }
}
