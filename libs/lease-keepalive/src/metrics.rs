//! Keepalive metrics.
//!
//! Registered lazily in the default prometheus registry on first access.
//! Registration failure is a programming error (duplicate metric name) and
//! panics at startup.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, register_int_counter, register_int_gauge};

lazy_static! {
    /// Count of leases granted by the coordinator
    pub static ref LEASES_GRANTED: IntCounter = register_int_counter!(
        "keepalive_leases_granted",
        "count of leases granted by the coordinator"
    ).unwrap();

    /// Count of grant attempts that failed or timed out
    pub static ref GRANT_FAILURES: IntCounter = register_int_counter!(
        "keepalive_grant_failures",
        "count of lease grant attempts that failed or timed out"
    ).unwrap();

    /// Count of leases revoked through the manager
    pub static ref LEASES_REVOKED: IntCounter = register_int_counter!(
        "keepalive_leases_revoked",
        "count of leases revoked through the manager"
    ).unwrap();

    /// Count of renewal confirmations relayed to callers
    pub static ref RENEWALS_RELAYED: IntCounter = register_int_counter!(
        "keepalive_renewals_relayed",
        "count of renewal confirmations relayed to callers"
    ).unwrap();

    /// Count of sessions ended by caller cancellation
    pub static ref SESSIONS_CANCELED: IntCounter = register_int_counter!(
        "keepalive_sessions_canceled",
        "count of keepalive sessions ended by caller cancellation"
    ).unwrap();

    /// Count of sessions ended by stream interruption
    pub static ref SESSIONS_INTERRUPTED: IntCounter = register_int_counter!(
        "keepalive_sessions_interrupted",
        "count of keepalive sessions ended by stream interruption"
    ).unwrap();

    /// Number of renewal loops currently running
    pub static ref ACTIVE_SESSIONS: IntGauge = register_int_gauge!(
        "keepalive_active_sessions",
        "number of keepalive renewal loops currently running"
    ).unwrap();
}
