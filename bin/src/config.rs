//! leasekeeper cli and tracing configs

pub mod cli {
    //! Parse from either cli or env var

    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "leasekeeper-worker";
    /// default log level. Can use this argument or KEEPALIVE_LOG env var
    pub const DEFAULT_KEEPALIVE_LOG: &str = "info";
    /// log as "json", "pretty" or "standard" (unstructured)
    pub static DEFAULT_LOG_FORMAT: &str = "standard";

    use std::{path::PathBuf, time::Duration};

    pub use clap::Parser;
    use clap::ValueEnum;
    use config::{Backend, KeepaliveConfig};

    /// coordinator implementation selectable from the command line
    #[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
    pub enum BackendArg {
        Etcd,
        Memory,
    }

    impl From<BackendArg> for Backend {
        fn from(arg: BackendArg) -> Self {
            match arg {
                BackendArg::Etcd => Backend::Etcd,
                BackendArg::Memory => Backend::Memory,
            }
        }
    }

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "leasekeeper", bin_name = "leasekeeper", about, long_about = None)]
    /// acquires a lease, binds a key to it and keeps it alive. Values given here
    /// override the config file. leasekeeper will load `.env` in the working dir as well
    pub struct Config {
        /// path to a YAML or JSON config, defaults are used when absent
        #[clap(short, long, value_parser, env = "KEEPALIVE_CONFIG")]
        pub config_path: Option<PathBuf>,
        /// coordinator implementation
        #[clap(long, env = "KEEPALIVE_BACKEND", value_enum)]
        pub backend: Option<BackendArg>,
        /// comma separated coordinator endpoints
        #[clap(long, env = "KEEPALIVE_ENDPOINTS", value_delimiter = ',')]
        pub endpoints: Vec<String>,
        /// lease ttl in seconds
        #[clap(long, env = "KEEPALIVE_TTL", value_parser)]
        pub ttl: Option<u64>,
        /// key bound to the lease
        #[clap(long, env = "KEEPALIVE_KEY", value_parser)]
        pub key: Option<String>,
        /// value of the bound key
        #[clap(long, env = "KEEPALIVE_VALUE", value_parser)]
        pub value: Option<String>,
        /// seconds to keep the lease alive, 0 runs until ctrl-c
        #[clap(long, env = "KEEPALIVE_RUN_FOR", value_parser)]
        pub run_for: Option<u64>,
        /// revoke the lease on a clean exit instead of letting it expire
        #[clap(long, env = "KEEPALIVE_REVOKE_ON_EXIT")]
        pub revoke_on_exit: bool,
        /// memory backend only: break the renewal stream after this many renewals
        #[clap(long, value_parser)]
        pub fail_after: Option<u64>,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// Number of worker threads, defaults to the number of cpus
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_KEEPALIVE_LOG)]
        pub keepalive_log: String,
        /// log output format: standard, json or pretty
        #[clap(long, env, value_parser, default_value = DEFAULT_LOG_FORMAT)]
        pub log_format: String,
    }

    impl Config {
        /// Load the config file (or defaults), then apply overrides given on the
        /// command line or environment.
        pub fn load(&self) -> anyhow::Result<KeepaliveConfig> {
            let mut cfg = match &self.config_path {
                Some(path) => KeepaliveConfig::parse(path)?,
                None => KeepaliveConfig::default(),
            };
            self.apply(&mut cfg);
            cfg.validate()?;
            Ok(cfg)
        }

        fn apply(&self, cfg: &mut KeepaliveConfig) {
            if let Some(backend) = self.backend {
                cfg.coordinator.backend = backend.into();
            }
            if !self.endpoints.is_empty() {
                cfg.coordinator.endpoints = self.endpoints.clone();
            }
            if let Some(ttl) = self.ttl {
                cfg.lease.ttl = Duration::from_secs(ttl);
            }
            if let Some(key) = &self.key {
                cfg.lease.key = Some(key.clone());
            }
            if let Some(value) = &self.value {
                cfg.lease.value = value.clone();
            }
            match self.run_for {
                Some(0) => cfg.lease.run_for = None,
                Some(secs) => cfg.lease.run_for = Some(Duration::from_secs(secs)),
                None => {}
            }
            if self.revoke_on_exit {
                cfg.lease.revoke_on_exit = true;
            }
        }
    }

}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    /// Configuration for log output
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Install the global subscriber
        pub fn parse(keepalive_log: &str, log_frmt: &str) -> Result<Self> {
            // Log level comes from KEEPALIVE_LOG
            let filter = EnvFilter::try_new(keepalive_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("h2=off".parse()?)
                .add_directive("tower=off".parse()?);

            match log_frmt {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .init();
                }
            }

            Ok(Self {
                log_frmt: log_frmt.to_owned(),
            })
        }
    }
}
