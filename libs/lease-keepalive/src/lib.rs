//! # lease-keepalive
//!
//! Client-side lease lifecycle manager. A lease is a time-bounded grant from a
//! remote coordinator that expires unless it is renewed. This crate provides:
//!
//! - **[`KeepaliveManager`]**: acquire, release and start keepalive sessions,
//!   every remote call bounded by a request timeout.
//! - **[`KeepaliveSession`]**: one background renewal loop per lease, relaying
//!   each confirmation in order and ending either silently (canceled) or with
//!   [`KeepaliveError::KeepaliveInterrupted`], never by just going quiet.
//! - **[`Coordinator`]** seam with an etcd implementation and an in-memory one.
//!
//! ```no_run
//! # use std::{sync::Arc, time::Duration};
//! # use lease_keepalive::{KeepaliveManager, MemoryCoordinator};
//! # async fn run() -> lease_keepalive::KeepaliveResult<()> {
//! let manager = KeepaliveManager::new(Arc::new(MemoryCoordinator::new()));
//! let lease = manager.acquire(Duration::from_secs(10)).await?;
//! let mut session = manager.start_keepalive(lease).await?;
//! while let Some(renewal) = session.next().await? {
//!     println!("ttl: {:?}", renewal.ttl);
//! }
//! # Ok(())
//! # }
//! ```
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod coordinator;
pub mod error;
pub mod etcd;
pub mod manager;
pub mod memory;
pub mod metrics;
pub mod models;
pub mod session;

pub use coordinator::{
    Coordinator, LeaseGrant, RenewalAck, RenewalStream, renew_interval, whole_seconds,
};
pub use error::{KeepaliveError, KeepaliveResult, StartError};
pub use etcd::EtcdCoordinator;
pub use manager::KeepaliveManager;
pub use memory::MemoryCoordinator;
pub use models::{KeepaliveState, Lease, LeaseId, RenewalEvent, Termination};
pub use session::{CancelHandle, KeepaliveSession};
