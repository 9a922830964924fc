//! etcd-backed coordinator.
//!
//! Uses the etcd v3 lease API through `etcd-client`. etcd does not push
//! renewals on its own: the client writes a keepalive request on the
//! bidirectional stream and etcd answers each one with the refreshed TTL. The
//! renewal stream here sends a request every third of the granted TTL and
//! relays the answers.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, LeaseKeepAliveStream, LeaseKeeper, PutOptions};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, trace};

use config::CoordinatorConfig;

use crate::coordinator::{
    Coordinator, LeaseGrant, RenewalAck, RenewalStream, renew_interval, whole_seconds,
};
use crate::error::{KeepaliveError, KeepaliveResult};
use crate::models::LeaseId;

/// Message etcd returns for unknown or expired leases.
const LEASE_NOT_FOUND: &str = "requested lease not found";

fn transport(op: &str, err: etcd_client::Error) -> KeepaliveError {
    KeepaliveError::Transport(format!("{op}: {err}"))
}

fn is_lease_not_found(err: &etcd_client::Error) -> bool {
    matches!(err, etcd_client::Error::GRpcStatus(status) if status.message().contains(LEASE_NOT_FOUND))
}

/// Coordinator talking to an etcd cluster.
#[derive(Clone)]
pub struct EtcdCoordinator {
    client: Client,
    endpoints: Vec<String>,
}

impl EtcdCoordinator {
    /// Connect to the configured endpoints.
    ///
    /// Fails with `CoordinatorUnavailable` if no endpoint answers within the
    /// dial timeout.
    pub async fn connect(config: &CoordinatorConfig) -> KeepaliveResult<Self> {
        if config.endpoints.is_empty() {
            return Err(KeepaliveError::Config(
                "etcd coordinator requires at least one endpoint".into(),
            ));
        }

        let mut opts = ConnectOptions::new().with_connect_timeout(config.dial_timeout);
        match (&config.username, &config.password) {
            (Some(user), Some(password)) => {
                opts = opts.with_user(user.clone(), password.clone());
            }
            (None, None) => {}
            _ => {
                return Err(KeepaliveError::Config(
                    "etcd auth requires both 'username' and 'password'".into(),
                ));
            }
        }

        info!(endpoints = ?config.endpoints, dial_timeout = ?config.dial_timeout, "connecting to etcd");
        let client = tokio::time::timeout(
            config.dial_timeout,
            Client::connect(config.endpoints.clone(), Some(opts)),
        )
        .await
        .map_err(|_| {
            KeepaliveError::CoordinatorUnavailable(format!(
                "etcd connect timed out after {:?}",
                config.dial_timeout
            ))
        })?
        .map_err(|e| KeepaliveError::CoordinatorUnavailable(format!("etcd connect failed: {e}")))?;

        info!("etcd connection established");
        Ok(Self {
            client,
            endpoints: config.endpoints.clone(),
        })
    }
}

impl std::fmt::Debug for EtcdCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdCoordinator")
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Coordinator for EtcdCoordinator {
    async fn grant(&self, ttl: Duration) -> KeepaliveResult<LeaseGrant> {
        let mut client = self.client.clone();
        let secs = i64::try_from(whole_seconds(ttl).as_secs()).unwrap_or(i64::MAX);
        let resp = client
            .lease_grant(secs, None)
            .await
            .map_err(|e| transport("lease grant", e))?;
        Ok(LeaseGrant {
            id: LeaseId::new(resp.id()),
            ttl: Duration::from_secs(resp.ttl().max(0) as u64),
        })
    }

    async fn keep_alive(&self, id: LeaseId) -> KeepaliveResult<Box<dyn RenewalStream>> {
        let mut client = self.client.clone();

        // granted TTL drives the renewal cadence; -1 means the lease is gone
        let ttl = client
            .lease_time_to_live(id.get(), None)
            .await
            .map_err(|e| transport("lease time-to-live", e))?;
        if ttl.ttl() <= 0 {
            return Err(KeepaliveError::InvalidLease(id));
        }
        let period = renew_interval(Duration::from_secs(ttl.granted_ttl() as u64));

        let (keeper, stream) = client
            .lease_keep_alive(id.get())
            .await
            .map_err(|e| transport("lease keepalive", e))?;
        debug!(lease = %id, ?period, "etcd keepalive stream opened");

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(Box::new(EtcdRenewalStream {
            id,
            period,
            keeper,
            stream,
            ticker,
        }))
    }

    async fn revoke(&self, id: LeaseId) -> KeepaliveResult<()> {
        let mut client = self.client.clone();
        match client.lease_revoke(id.get()).await {
            Ok(_) => Ok(()),
            Err(err) if is_lease_not_found(&err) => Err(KeepaliveError::InvalidLease(id)),
            Err(err) => Err(transport("lease revoke", err)),
        }
    }

    async fn put_with_lease(&self, id: LeaseId, key: &str, value: &str) -> KeepaliveResult<()> {
        let mut client = self.client.clone();
        let opts = PutOptions::new().with_lease(id.get());
        match client.put(key, value, Some(opts)).await {
            Ok(_) => Ok(()),
            Err(err) if is_lease_not_found(&err) => Err(KeepaliveError::InvalidLease(id)),
            Err(err) => Err(transport("put", err)),
        }
    }
}

struct EtcdRenewalStream {
    id: LeaseId,
    period: Duration,
    keeper: LeaseKeeper,
    stream: LeaseKeepAliveStream,
    ticker: Interval,
}

impl std::fmt::Debug for EtcdRenewalStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdRenewalStream")
            .field("id", &self.id)
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RenewalStream for EtcdRenewalStream {
    async fn next_renewal(&mut self) -> KeepaliveResult<Option<RenewalAck>> {
        loop {
            tokio::select! {
                msg = self.stream.message() => {
                    return match msg {
                        Ok(Some(resp)) => Ok(Some(RenewalAck::new(LeaseId::new(resp.id()), resp.ttl()))),
                        Ok(None) => Ok(None),
                        Err(err) => Err(transport("keepalive stream", err)),
                    };
                }
                _ = self.ticker.tick() => {
                    self.keeper
                        .keep_alive()
                        .await
                        .map_err(|e| transport("keepalive request", e))?;
                    trace!(lease = %self.id, "keepalive request sent");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(endpoints: Vec<String>) -> CoordinatorConfig {
        CoordinatorConfig {
            endpoints,
            dial_timeout: Duration::from_millis(200),
            ..CoordinatorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_connect_requires_endpoint() {
        let err = EtcdCoordinator::connect(&config(Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, KeepaliveError::Config(_)));
    }

    #[tokio::test]
    async fn test_connect_rejects_partial_auth() {
        let mut cfg = config(vec!["localhost:2379".into()]);
        cfg.username = Some("root".into());
        let err = EtcdCoordinator::connect(&cfg).await.unwrap_err();
        assert!(matches!(err, KeepaliveError::Config(_)));
    }
}
