//! In-process coordinator.
//!
//! Holds leases and lease-bound keys in memory. Renewal confirmations are
//! either pushed by hand (`push_renewal`, `sever`, `close_stream`, ...) or
//! generated on a fixed cadence with [`MemoryCoordinator::with_auto_renew`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::debug;

use crate::coordinator::{Coordinator, LeaseGrant, RenewalAck, RenewalStream, whole_seconds};
use crate::error::{KeepaliveError, KeepaliveResult};
use crate::models::LeaseId;

#[derive(Debug)]
enum Push {
    Ack(RenewalAck),
    Fault(String),
    Close,
}

#[derive(Debug)]
struct MemoryLease {
    ttl: Duration,
    streams: Vec<mpsc::UnboundedSender<Push>>,
}

#[derive(Debug)]
struct Inner {
    next_id: i64,
    available: bool,
    leases: BTreeMap<LeaseId, MemoryLease>,
    keys: BTreeMap<String, (String, LeaseId)>,
}

#[derive(Debug, Clone)]
pub struct MemoryCoordinator {
    inner: Arc<Mutex<Inner>>,
    grant_delay: Option<Duration>,
    auto_renew: Option<Duration>,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

fn unreachable_err() -> KeepaliveError {
    KeepaliveError::Transport("memory coordinator unreachable".into())
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 1,
                available: true,
                leases: BTreeMap::new(),
                keys: BTreeMap::new(),
            })),
            grant_delay: None,
            auto_renew: None,
        }
    }

    /// Delay every grant by `delay`, to exercise request timeouts.
    pub fn with_grant_delay(mut self, delay: Duration) -> Self {
        self.grant_delay = Some(delay);
        self
    }

    /// Confirm a renewal for every open stream each `interval`.
    pub fn with_auto_renew(mut self, interval: Duration) -> Self {
        self.auto_renew = Some(interval);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory coordinator lock poisoned")
    }

    /// Toggle reachability. While unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    pub fn has_lease(&self, id: LeaseId) -> bool {
        self.lock().leases.contains_key(&id)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().keys.get(key).map(|(value, _)| value.clone())
    }

    /// Number of renewal streams for `id` whose receiving end is still open.
    pub fn open_streams(&self, id: LeaseId) -> usize {
        self.lock()
            .leases
            .get(&id)
            .map(|lease| lease.streams.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    fn push(&self, id: LeaseId, make: impl Fn() -> Push) -> usize {
        let mut inner = self.lock();
        let Some(lease) = inner.leases.get_mut(&id) else {
            return 0;
        };
        lease.streams.retain(|tx| !tx.is_closed());
        lease
            .streams
            .iter()
            .filter(|tx| tx.send(make()).is_ok())
            .count()
    }

    /// Push a renewal confirmation for `id` to its open streams. Returns how
    /// many streams received it.
    pub fn push_renewal(&self, id: LeaseId, ttl_secs: i64) -> usize {
        self.push(id, || Push::Ack(RenewalAck::new(id, ttl_secs)))
    }

    /// Push a confirmation carrying `other`'s id onto `id`'s streams.
    pub fn push_foreign_renewal(&self, id: LeaseId, other: LeaseId, ttl_secs: i64) -> usize {
        self.push(id, || Push::Ack(RenewalAck::new(other, ttl_secs)))
    }

    /// Break the transport under every stream of `id`.
    pub fn sever(&self, id: LeaseId, reason: &str) -> usize {
        self.push(id, || Push::Fault(reason.to_string()))
    }

    /// Close every stream of `id` without an error.
    pub fn close_stream(&self, id: LeaseId) -> usize {
        self.push(id, || Push::Close)
    }

    /// Expire `id` as if its TTL ran out: keys are deleted and open streams
    /// receive a zero-TTL confirmation.
    pub fn expire(&self, id: LeaseId) -> bool {
        let mut inner = self.lock();
        let Some(lease) = inner.leases.remove(&id) else {
            return false;
        };
        inner.keys.retain(|_, (_, owner)| *owner != id);
        for tx in lease.streams {
            let _ = tx.send(Push::Ack(RenewalAck::new(id, 0)));
        }
        true
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn grant(&self, ttl: Duration) -> KeepaliveResult<LeaseGrant> {
        if let Some(delay) = self.grant_delay {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.lock();
        if !inner.available {
            return Err(unreachable_err());
        }
        let id = LeaseId::new(inner.next_id);
        inner.next_id += 1;
        let ttl = whole_seconds(ttl);
        inner.leases.insert(
            id,
            MemoryLease {
                ttl,
                streams: Vec::new(),
            },
        );
        debug!(lease = %id, ?ttl, "memory lease granted");
        Ok(LeaseGrant { id, ttl })
    }

    async fn keep_alive(&self, id: LeaseId) -> KeepaliveResult<Box<dyn RenewalStream>> {
        let mut inner = self.lock();
        if !inner.available {
            return Err(unreachable_err());
        }
        let lease = inner
            .leases
            .get_mut(&id)
            .ok_or(KeepaliveError::InvalidLease(id))?;
        let (tx, rx) = mpsc::unbounded_channel();
        lease.streams.push(tx);
        let ttl_secs = lease.ttl.as_secs() as i64;

        let auto = self.auto_renew.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        Ok(Box::new(MemoryRenewalStream {
            id,
            ttl_secs,
            rx,
            auto,
        }))
    }

    async fn revoke(&self, id: LeaseId) -> KeepaliveResult<()> {
        let mut inner = self.lock();
        if !inner.available {
            return Err(unreachable_err());
        }
        let lease = inner
            .leases
            .remove(&id)
            .ok_or(KeepaliveError::InvalidLease(id))?;
        inner.keys.retain(|_, (_, owner)| *owner != id);
        for tx in lease.streams {
            let _ = tx.send(Push::Ack(RenewalAck::new(id, 0)));
        }
        debug!(lease = %id, "memory lease revoked");
        Ok(())
    }

    async fn put_with_lease(&self, id: LeaseId, key: &str, value: &str) -> KeepaliveResult<()> {
        let mut inner = self.lock();
        if !inner.available {
            return Err(unreachable_err());
        }
        if !inner.leases.contains_key(&id) {
            return Err(KeepaliveError::InvalidLease(id));
        }
        inner
            .keys
            .insert(key.to_string(), (value.to_string(), id));
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryRenewalStream {
    id: LeaseId,
    ttl_secs: i64,
    rx: mpsc::UnboundedReceiver<Push>,
    auto: Option<Interval>,
}

async fn tick(auto: &mut Option<Interval>) {
    match auto {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[async_trait]
impl RenewalStream for MemoryRenewalStream {
    async fn next_renewal(&mut self) -> KeepaliveResult<Option<RenewalAck>> {
        tokio::select! {
            biased;
            push = self.rx.recv() => match push {
                Some(Push::Ack(ack)) => Ok(Some(ack)),
                Some(Push::Fault(reason)) => Err(KeepaliveError::Transport(reason)),
                Some(Push::Close) | None => Ok(None),
            },
            _ = tick(&mut self.auto) => Ok(Some(RenewalAck::new(self.id, self.ttl_secs))),
        }
    }
}
