use std::{sync::Arc, time::Duration};

use config::SessionConfig;
use futures::StreamExt;
use lease_keepalive::{
    KeepaliveError, KeepaliveManager, KeepaliveState, LeaseId, MemoryCoordinator, Termination,
};

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

fn setup() -> (MemoryCoordinator, KeepaliveManager) {
    let memory = MemoryCoordinator::new();
    let manager = KeepaliveManager::new(Arc::new(memory.clone()));
    (memory, manager)
}

/// waits until every renewal loop of `manager` has exited
async fn settle(manager: &KeepaliveManager) {
    tokio::time::timeout(secs(1), async {
        while manager.active_sessions() > 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("renewal loops still running");
}

#[tokio::test(start_paused = true)]
async fn test_renewals_relayed_in_order_then_cancel() {
    let (memory, manager) = setup();
    let lease = manager.acquire(secs(10)).await.unwrap();
    let id = lease.id();
    assert_eq!(lease.ttl(), secs(10));
    let mut session = manager.start_keepalive(lease).await.unwrap();
    assert_eq!(manager.active_sessions(), 1);

    // coordinator confirms at roughly 3s, 6s and 9s
    for seq in 1..=3 {
        tokio::time::sleep(secs(3)).await;
        assert_eq!(memory.push_renewal(id, 10), 1);
        let event = session.next().await.unwrap().unwrap();
        assert_eq!(event.lease_id, id);
        assert_eq!(event.ttl, secs(10));
        assert_eq!(event.seq, seq);
    }

    session.cancel_handle().cancel();
    assert!(session.next().await.unwrap().is_none());
    assert!(session.next().await.unwrap_err().is_invalid_lease());

    session.cancel().await;
    assert_eq!(session.state(), KeepaliveState::Canceled);
    assert_eq!(session.termination(), Some(Termination::Canceled));
    assert_eq!(manager.active_sessions(), 0);
    assert_eq!(memory.open_streams(id), 0);
    // canceling does not revoke
    assert!(memory.has_lease(id));
}

#[tokio::test]
async fn test_transport_fault_after_two_renewals() {
    let (memory, manager) = setup();
    let lease = manager.acquire(secs(10)).await.unwrap();
    let id = lease.id();
    let mut session = manager.start_keepalive(lease).await.unwrap();

    memory.push_renewal(id, 10);
    memory.push_renewal(id, 10);
    memory.sever(id, "connection reset");

    assert_eq!(session.next().await.unwrap().unwrap().seq, 1);
    assert_eq!(session.next().await.unwrap().unwrap().seq, 2);
    match session.next().await {
        Err(KeepaliveError::KeepaliveInterrupted { lease, reason }) => {
            assert_eq!(lease, id);
            assert_eq!(reason, "connection reset");
        }
        other => panic!("expected interruption, got {other:?}"),
    }
    assert_eq!(session.state(), KeepaliveState::Interrupted);
    assert!(session.next().await.unwrap_err().is_invalid_lease());

    settle(&manager).await;
    assert_eq!(memory.open_streams(id), 0);
}

#[tokio::test]
async fn test_stream_closed_by_coordinator_is_interruption() {
    let (memory, manager) = setup();
    let lease = manager.acquire(secs(10)).await.unwrap();
    let id = lease.id();
    let mut session = manager.start_keepalive(lease).await.unwrap();

    memory.close_stream(id);
    let err = session.next().await.unwrap_err();
    assert!(err.is_interrupted());
    assert!(err.to_string().contains("closed by coordinator"));
}

#[tokio::test]
async fn test_cancel_before_first_renewal() {
    let (memory, manager) = setup();
    let lease = manager.acquire(secs(10)).await.unwrap();
    let id = lease.id();
    let mut session = manager.start_keepalive(lease).await.unwrap();

    session.cancel().await;
    assert!(session.next().await.unwrap().is_none());
    assert_eq!(manager.active_sessions(), 0);
    assert_eq!(memory.open_streams(id), 0);
}

#[tokio::test]
async fn test_cancel_drops_buffered_renewals() {
    let (memory, manager) = setup();
    let lease = manager.acquire(secs(10)).await.unwrap();
    let id = lease.id();
    let mut session = manager.start_keepalive(lease).await.unwrap();

    memory.push_renewal(id, 10);
    assert!(session.next().await.unwrap().is_some());
    memory.push_renewal(id, 10);
    session.cancel_handle().cancel();
    assert!(session.next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_acquire_then_release() {
    let (memory, manager) = setup();
    let lease = manager.acquire(secs(5)).await.unwrap();
    let id = lease.id();
    assert!(memory.has_lease(id));

    manager.release(lease).await.unwrap();
    assert!(!memory.has_lease(id));
    assert_eq!(manager.active_sessions(), 0);
}

#[tokio::test]
async fn test_sub_second_ttl_rounds_up() {
    let (_memory, manager) = setup();
    let lease = manager.acquire(Duration::from_millis(1500)).await.unwrap();
    assert_eq!(lease.ttl(), secs(2));
}

#[tokio::test]
async fn test_failed_start_hands_lease_back() {
    let (memory, manager) = setup();
    let lease = manager.acquire(secs(10)).await.unwrap();
    let id = lease.id();
    manager.attach_key(&lease, "foo", "bar").await.unwrap();

    memory.set_available(false);
    let err = manager.start_keepalive(lease).await.unwrap_err();
    assert!(err.error().is_unavailable(), "{err}");
    assert_eq!(manager.active_sessions(), 0);

    memory.set_available(true);
    manager.release(err.into_lease()).await.unwrap();
    assert!(!memory.has_lease(id));
    assert_eq!(memory.get("foo"), None);
}

#[tokio::test]
async fn test_failed_start_can_be_retried() {
    let (memory, manager) = setup();
    let lease = manager.acquire(secs(10)).await.unwrap();
    let id = lease.id();

    memory.set_available(false);
    let lease = manager.start_keepalive(lease).await.unwrap_err().into_lease();
    memory.set_available(true);
    let mut session = manager.start_keepalive(lease).await.unwrap();
    memory.push_renewal(id, 10);
    assert_eq!(session.next().await.unwrap().unwrap().lease_id, id);
}

#[tokio::test]
async fn test_break_before_cancel_is_not_silent() {
    let (memory, manager) = setup();
    let lease = manager.acquire(secs(10)).await.unwrap();
    let id = lease.id();
    let mut session = manager.start_keepalive(lease).await.unwrap();

    memory.push_renewal(id, 10);
    memory.sever(id, "connection reset");
    settle(&manager).await;
    assert_eq!(session.state(), KeepaliveState::Interrupted);

    session.cancel_handle().cancel();
    match session.next().await {
        Err(KeepaliveError::KeepaliveInterrupted { lease, reason }) => {
            assert_eq!(lease, id);
            assert_eq!(reason, "connection reset");
        }
        other => panic!("expected interruption, got {other:?}"),
    }
    assert!(session.next().await.unwrap_err().is_invalid_lease());
}

#[tokio::test]
async fn test_leases_are_distinct() {
    let (_memory, manager) = setup();
    let a = manager.acquire(secs(5)).await.unwrap();
    let b = manager.acquire(secs(5)).await.unwrap();
    assert_ne!(a.id(), b.id());
}

#[tokio::test]
async fn test_acquire_rejects_short_ttl() {
    let (_memory, manager) = setup();
    for ttl in [Duration::ZERO, Duration::from_millis(500)] {
        assert!(matches!(
            manager.acquire(ttl).await,
            Err(KeepaliveError::Config(_))
        ));
    }
}

#[tokio::test]
async fn test_acquire_unreachable_coordinator() {
    let (memory, manager) = setup();
    memory.set_available(false);
    let err = manager.acquire(secs(10)).await.unwrap_err();
    assert!(err.is_unavailable(), "{err}");

    memory.set_available(true);
    assert!(manager.acquire(secs(10)).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_acquire_times_out() {
    let memory = MemoryCoordinator::new().with_grant_delay(secs(5));
    let manager = KeepaliveManager::with_config(
        Arc::new(memory.clone()),
        SessionConfig {
            request_timeout: secs(2),
            ..SessionConfig::default()
        },
    );
    let err = manager.acquire(secs(10)).await.unwrap_err();
    assert!(err.is_unavailable());
    assert!(err.to_string().contains("timed out"), "{err}");
    // the abandoned grant never reached the coordinator
    assert!(!memory.has_lease(LeaseId::new(1)));
}

#[tokio::test]
async fn test_foreign_renewals_are_discarded() {
    let (memory, manager) = setup();
    let lease = manager.acquire(secs(10)).await.unwrap();
    let id = lease.id();
    let mut session = manager.start_keepalive(lease).await.unwrap();

    memory.push_foreign_renewal(id, LeaseId::new(999), 10);
    memory.push_renewal(id, 7);
    let event = session.next().await.unwrap().unwrap();
    assert_eq!(event.lease_id, id);
    assert_eq!(event.ttl, secs(7));
    assert_eq!(event.seq, 1);
}

#[tokio::test]
async fn test_expired_lease_interrupts_session() {
    let (memory, manager) = setup();
    let lease = manager.acquire(secs(10)).await.unwrap();
    let id = lease.id();
    manager.attach_key(&lease, "foo", "bar").await.unwrap();
    let mut session = manager.start_keepalive(lease).await.unwrap();

    assert!(memory.expire(id));
    let err = session.next().await.unwrap_err();
    assert!(err.is_interrupted());
    assert!(err.to_string().contains("expired or revoked"), "{err}");
    assert_eq!(memory.get("foo"), None);
}

#[tokio::test]
async fn test_dropping_session_stops_renewals() {
    let (memory, manager) = setup();
    let lease = manager.acquire(secs(10)).await.unwrap();
    let id = lease.id();
    let session = manager.start_keepalive(lease).await.unwrap();
    assert_eq!(memory.open_streams(id), 1);

    drop(session);
    settle(&manager).await;
    assert_eq!(memory.open_streams(id), 0);
}

#[tokio::test]
async fn test_release_session_deletes_bound_key() {
    let (memory, manager) = setup();
    let lease = manager.acquire(secs(10)).await.unwrap();
    let id = lease.id();
    manager.attach_key(&lease, "foo", "bar").await.unwrap();
    assert_eq!(memory.get("foo").as_deref(), Some("bar"));

    let mut session = manager.start_keepalive(lease).await.unwrap();
    memory.push_renewal(id, 10);
    assert!(session.next().await.unwrap().is_some());

    manager.release_session(session).await.unwrap();
    assert_eq!(memory.get("foo"), None);
    assert!(!memory.has_lease(id));
    assert_eq!(memory.open_streams(id), 0);
    assert_eq!(manager.active_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_expired_lease_cannot_be_kept_alive() {
    let (_memory, manager) = setup();
    let lease = manager.acquire(secs(1)).await.unwrap();
    tokio::time::advance(secs(2)).await;
    assert!(lease.is_expired());

    assert!(
        manager
            .attach_key(&lease, "foo", "bar")
            .await
            .unwrap_err()
            .is_invalid_lease()
    );
    let err = manager.start_keepalive(lease).await.unwrap_err();
    assert!(err.error().is_invalid_lease());
    assert!(err.lease().is_expired());
    assert_eq!(manager.active_sessions(), 0);
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let (memory, manager) = setup();
    let a = manager.acquire(secs(10)).await.unwrap();
    let b = manager.acquire(secs(10)).await.unwrap();
    let (a_id, b_id) = (a.id(), b.id());
    let mut a = manager.start_keepalive(a).await.unwrap();
    let mut b = manager.start_keepalive(b).await.unwrap();
    assert_eq!(manager.active_sessions(), 2);

    memory.sever(a_id, "reset");
    memory.push_renewal(b_id, 10);
    assert!(a.next().await.unwrap_err().is_interrupted());
    assert_eq!(b.next().await.unwrap().unwrap().lease_id, b_id);

    settle_one(&manager).await;
    b.cancel().await;
    assert_eq!(manager.active_sessions(), 0);
}

/// waits until only one renewal loop is left
async fn settle_one(manager: &KeepaliveManager) {
    tokio::time::timeout(secs(1), async {
        while manager.active_sessions() > 1 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("interrupted loop still running");
}

#[tokio::test(start_paused = true)]
async fn test_auto_renew_as_stream() {
    let memory = MemoryCoordinator::new().with_auto_renew(secs(3));
    let manager = KeepaliveManager::new(Arc::new(memory.clone()));
    let lease = manager.acquire(secs(10)).await.unwrap();
    let id = lease.id();
    let session = manager.start_keepalive(lease).await.unwrap();
    let handle = session.cancel_handle();

    let events: Vec<_> = session.into_stream().take(3).collect().await;
    assert_eq!(events.len(), 3);
    for (i, event) in events.into_iter().enumerate() {
        let event = event.unwrap();
        assert_eq!(event.seq, i as u64 + 1);
        assert_eq!(event.ttl, secs(10));
    }
    handle.cancel();
    settle(&manager).await;
    assert_eq!(memory.open_streams(id), 0);
}

#[tokio::test]
async fn test_stream_ends_after_interruption() {
    let (memory, manager) = setup();
    let lease = manager.acquire(secs(10)).await.unwrap();
    let id = lease.id();
    let session = manager.start_keepalive(lease).await.unwrap();

    memory.push_renewal(id, 10);
    memory.push_renewal(id, 10);
    memory.sever(id, "reset");
    let items: Vec<_> = session.into_stream().collect().await;
    assert_eq!(items.len(), 3);
    assert!(items[..2].iter().all(Result::is_ok));
    assert!(items[2].as_ref().unwrap_err().is_interrupted());
}
