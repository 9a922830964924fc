use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use tracing::debug;

pub mod wire;

pub use wire::Backend;

/// Default coordinator endpoint
pub const DEFAULT_ENDPOINT: &str = "localhost:2379";
/// Default dial timeout
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// Default lease ttl
pub const DEFAULT_TTL: Duration = Duration::from_secs(10);
/// Default key bound to the lease
pub const DEFAULT_KEY: &str = "foo";
/// Default value of the bound key
pub const DEFAULT_VALUE: &str = "bar";
/// Default time to keep the lease alive before canceling
pub const DEFAULT_RUN_FOR: Duration = Duration::from_secs(20);
/// Default bound on each coordinator request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);
/// Default number of renewals buffered between relay task and caller
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// how to reach the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub backend: Backend,
    pub endpoints: Vec<String>,
    pub dial_timeout: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Etcd,
            endpoints: vec![DEFAULT_ENDPOINT.to_owned()],
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            username: None,
            password: None,
        }
    }
}

/// the lease to acquire and what to bind to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseConfig {
    pub ttl: Duration,
    /// key bound to the lease, if any
    pub key: Option<String>,
    pub value: String,
    /// `None` keeps the lease alive until interrupted
    pub run_for: Option<Duration>,
    pub revoke_on_exit: bool,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            key: Some(DEFAULT_KEY.to_owned()),
            value: DEFAULT_VALUE.to_owned(),
            run_for: Some(DEFAULT_RUN_FOR),
            revoke_on_exit: false,
        }
    }
}

/// keepalive manager tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub request_timeout: Duration,
    pub channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// validated keepalive config
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeepaliveConfig {
    pub coordinator: CoordinatorConfig,
    pub lease: LeaseConfig,
    pub session: SessionConfig,
    path: Option<PathBuf>,
}

impl KeepaliveConfig {
    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path)
            .with_context(|| format!("failed to find config at {}", &path.display()))?;
        let mut config = Self::parse_str(input)
            .with_context(|| format!("invalid config at {}", &path.display()))?;
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse_str<S: AsRef<str>>(s: S) -> Result<Self> {
        let s = s.as_ref();
        let wire = match serde_json::from_str::<wire::Config>(s) {
            Ok(wire) => wire,
            Err(_err) => serde_yaml::from_str::<wire::Config>(s)?,
        };
        debug!(?wire);
        Self::try_from(wire)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Reject values no coordinator can work with.
    pub fn validate(&self) -> Result<()> {
        if self.coordinator.backend == Backend::Etcd && self.coordinator.endpoints.is_empty() {
            bail!("etcd backend requires at least one endpoint");
        }
        if self.coordinator.dial_timeout.is_zero() {
            bail!("dial_timeout must be greater than zero");
        }
        if self.lease.ttl < Duration::from_secs(1) {
            bail!("lease ttl must be at least 1s, got {:?}", self.lease.ttl);
        }
        if self.session.request_timeout.is_zero() {
            bail!("request_timeout must be greater than zero");
        }
        if self.session.channel_capacity == 0 {
            bail!("channel_capacity must be greater than zero");
        }
        Ok(())
    }
}

impl TryFrom<wire::Config> for KeepaliveConfig {
    type Error = anyhow::Error;

    fn try_from(wire: wire::Config) -> Result<Self> {
        let coordinator_default = CoordinatorConfig::default();
        let lease_default = LeaseConfig::default();
        let session_default = SessionConfig::default();

        let config = Self {
            coordinator: CoordinatorConfig {
                backend: wire.coordinator.backend,
                endpoints: wire
                    .coordinator
                    .endpoints
                    .unwrap_or(coordinator_default.endpoints),
                dial_timeout: wire
                    .coordinator
                    .dial_timeout
                    .unwrap_or(coordinator_default.dial_timeout),
                username: wire.coordinator.username,
                password: wire.coordinator.password,
            },
            lease: LeaseConfig {
                ttl: wire.lease.ttl.unwrap_or(lease_default.ttl),
                key: wire.lease.key.or(lease_default.key),
                value: wire.lease.value.unwrap_or(lease_default.value),
                run_for: match wire.lease.run_for {
                    Some(d) if d.is_zero() => None,
                    Some(d) => Some(d),
                    None => lease_default.run_for,
                },
                revoke_on_exit: wire.lease.revoke_on_exit,
            },
            session: SessionConfig {
                request_timeout: wire
                    .session
                    .request_timeout
                    .unwrap_or(session_default.request_timeout),
                channel_capacity: wire
                    .session
                    .channel_capacity
                    .unwrap_or(session_default.channel_capacity),
            },
            path: None,
        };
        config.validate()?;
        Ok(config)
    }
}
