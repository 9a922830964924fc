//! Keepalive sessions.
//!
//! A session owns one lease and one background task. The task keeps the
//! coordinator's renewal stream open and relays every confirmation for the
//! lease through a bounded channel, in the order the coordinator issued them.
//! It exits on cancellation (silent end) or on any stream failure, which is
//! always reported to the caller as [`KeepaliveError::KeepaliveInterrupted`].

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::Stream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, info_span, trace, warn};
use tracing_futures::Instrument;

use crate::coordinator::RenewalStream;
use crate::error::{KeepaliveError, KeepaliveResult};
use crate::metrics;
use crate::models::{KeepaliveState, Lease, LeaseId, RenewalEvent, Termination};

type Delivery = KeepaliveResult<RenewalEvent>;

/// Counts a running renewal loop for as long as it is alive.
#[derive(Debug)]
struct ActiveGuard {
    active: Arc<AtomicUsize>,
}

impl ActiveGuard {
    fn new(active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        metrics::ACTIVE_SESSIONS.inc();
        Self { active }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        metrics::ACTIVE_SESSIONS.dec();
    }
}

/// Cloneable handle that cancels a session from another task.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Signal voluntary termination. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// An active renewal loop bound to a single lease.
///
/// Dropping the session cancels it.
#[derive(Debug)]
pub struct KeepaliveSession {
    lease: Lease,
    rx: mpsc::Receiver<Delivery>,
    token: CancellationToken,
    status: watch::Receiver<Option<Termination>>,
    task: Option<JoinHandle<()>>,
    finished: bool,
    _abandon: DropGuard,
}

impl KeepaliveSession {
    pub(crate) fn spawn(
        lease: Lease,
        stream: Box<dyn RenewalStream>,
        capacity: usize,
        active: Arc<AtomicUsize>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (status_tx, status) = watch::channel(None);
        let token = CancellationToken::new();
        let guard = ActiveGuard::new(active);
        let span = info_span!("keepalive", lease = %lease.id());

        let task = tokio::spawn(
            relay(lease.id(), stream, tx, token.clone(), status_tx, guard).instrument(span),
        );

        Self {
            lease,
            rx,
            _abandon: token.clone().drop_guard(),
            token,
            status,
            task: Some(task),
            finished: false,
        }
    }

    /// The lease this session keeps alive.
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Current lifecycle state: `Active` until the renewal loop exits.
    pub fn state(&self) -> KeepaliveState {
        self.status
            .borrow()
            .as_ref()
            .map(Termination::state)
            .unwrap_or(KeepaliveState::Active)
    }

    /// How the renewal loop ended, once it has.
    pub fn termination(&self) -> Option<Termination> {
        self.status.borrow().clone()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token: self.token.clone(),
        }
    }

    /// Wait for the next renewal.
    ///
    /// Returns `Ok(Some(_))` per confirmation, `Ok(None)` once after
    /// cancellation, or `Err(KeepaliveInterrupted)` once after the stream
    /// broke, even when the cancel came later. The sequence cannot be resumed: later calls fail with
    /// `InvalidLease`.
    pub async fn next(&mut self) -> KeepaliveResult<Option<RenewalEvent>> {
        if self.finished {
            return Err(KeepaliveError::InvalidLease(self.lease.id()));
        }
        // buffered events are dropped once canceled
        if self.token.is_cancelled() {
            return self.end_canceled();
        }

        let delivery = tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            delivery = self.rx.recv() => delivery,
        };

        match delivery {
            Some(Ok(event)) => Ok(Some(event)),
            Some(Err(err)) => {
                self.finished = true;
                Err(err)
            }
            None if self.token.is_cancelled() => self.end_canceled(),
            None => {
                // relay task died without reporting, e.g. it panicked
                self.finished = true;
                Err(KeepaliveError::KeepaliveInterrupted {
                    lease: self.lease.id(),
                    reason: "keepalive task exited unexpectedly".into(),
                })
            }
        }
    }

    /// Terminal value after cancellation. A stream that broke before the
    /// cancel still reports the interruption.
    fn end_canceled(&mut self) -> KeepaliveResult<Option<RenewalEvent>> {
        self.finished = true;
        match self.termination() {
            Some(Termination::Interrupted(err)) => Err(err),
            _ => Ok(None),
        }
    }

    /// Cancel the session and wait until the renewal stream is released.
    /// Idempotent.
    pub async fn cancel(&mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                error!(lease = %self.lease.id(), ?err, "keepalive task panicked");
            }
        }
    }

    /// Cancel the session and hand back its lease, e.g. to revoke it.
    pub(crate) async fn into_lease(mut self) -> Lease {
        self.cancel().await;
        self.lease
    }

    /// Adapt the session into a `Stream` that ends after cancellation or
    /// after yielding the interruption error.
    pub fn into_stream(self) -> impl Stream<Item = KeepaliveResult<RenewalEvent>> + Send {
        futures::stream::unfold(Some(self), |state| async move {
            let mut session = state?;
            match session.next().await {
                Ok(Some(event)) => Some((Ok(event), Some(session))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}

async fn relay(
    lease: LeaseId,
    mut stream: Box<dyn RenewalStream>,
    tx: mpsc::Sender<Delivery>,
    token: CancellationToken,
    status: watch::Sender<Option<Termination>>,
    _guard: ActiveGuard,
) {
    debug!("keepalive relay started");
    let mut seq = 0u64;

    let termination = loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => break Termination::Canceled,
            next = stream.next_renewal() => next,
        };

        let ack = match next {
            Ok(Some(ack)) => ack,
            Ok(None) => {
                break Termination::Interrupted(KeepaliveError::KeepaliveInterrupted {
                    lease,
                    reason: "renewal stream closed by coordinator".into(),
                });
            }
            Err(err) => break Termination::Interrupted(err.into_interruption(lease)),
        };

        if ack.id != lease {
            warn!(other = %ack.id, "discarding renewal for a different lease");
            continue;
        }
        if ack.is_expired() {
            break Termination::Interrupted(
                KeepaliveError::InvalidLease(lease).into_interruption(lease),
            );
        }

        seq += 1;
        let event = RenewalEvent {
            lease_id: lease,
            ttl: Duration::from_secs(ack.ttl_secs as u64),
            seq,
            received_at: Utc::now(),
        };
        trace!(seq, ttl = ack.ttl_secs, "relaying renewal");

        tokio::select! {
            biased;
            _ = token.cancelled() => break Termination::Canceled,
            sent = tx.send(Ok(event)) => {
                if sent.is_err() {
                    // receiver gone with the session
                    break Termination::Canceled;
                }
            }
        }
        metrics::RENEWALS_RELAYED.inc();
    };

    drop(stream);
    status.send_replace(Some(termination.clone()));

    match termination {
        Termination::Canceled => {
            metrics::SESSIONS_CANCELED.inc();
            info!(renewals = seq, "keepalive canceled");
        }
        Termination::Interrupted(err) => {
            metrics::SESSIONS_INTERRUPTED.inc();
            error!(renewals = seq, %err, "keepalive interrupted");
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = tx.send(Err(err)) => {}
            }
        }
    }
}
