#![allow(clippy::cognitive_complexity)]
use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{runtime::Builder, signal, task::JoinHandle};
use tracing::*;

mod config;

use ::config::{Backend, KeepaliveConfig};
use crate::config::{
    cli::{self, Parser},
    trace,
};
use lease_keepalive::{
    Coordinator, EtcdCoordinator, KeepaliveManager, KeepaliveSession, MemoryCoordinator,
    Termination, renew_interval,
};

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.keepalive_log, &config.log_format)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv::dotenv() {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    // if we have a configured value here, set it
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    // build the runtime
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => {
                error!(?err, "keepalive task panicked");
                Err(anyhow!(err))
            }
            Ok(Err(err)) => {
                error!(?err, "exited with error");
                Err(err)
            }
            Ok(Ok(())) => {
                debug!("exiting...");
                Ok(())
            }
        }
    })
}

async fn start(cli: cli::Config) -> Result<()> {
    let cfg = cli.load()?;
    info!(backend = ?cfg.coordinator.backend, path = ?cfg.path(), "starting leasekeeper");

    let (coordinator, memory) = connect(&cfg).await?;
    let manager = KeepaliveManager::with_config(coordinator, cfg.session.clone());

    let lease = manager
        .acquire(cfg.lease.ttl)
        .await
        .context("failed to acquire lease")?;
    if let Some(key) = &cfg.lease.key {
        manager
            .attach_key(&lease, key, &cfg.lease.value)
            .await
            .with_context(|| format!("failed to bind key {key} to lease {}", lease.id()))?;
        info!(key, value = %cfg.lease.value, lease = %lease.id(), "key bound to lease");
    }
    let label = cfg
        .lease
        .key
        .clone()
        .unwrap_or_else(|| lease.id().to_string());

    let session = match manager.start_keepalive(lease).await {
        Ok(session) => session,
        Err(err) => {
            let (err, lease) = err.into_parts();
            // don't leave the grant and its key behind
            if let Err(revoke_err) = manager.release(lease).await {
                warn!(%revoke_err, "failed to revoke lease after keepalive start failed");
            }
            return Err(anyhow!(err).context("failed to start keepalive"));
        }
    };
    if cli.fail_after.is_some() && memory.is_none() {
        warn!("--fail-after only applies to the memory backend, ignoring");
    }
    let fault = memory.zip(cli.fail_after);

    let handle = session.cancel_handle();
    let mut watcher = tokio::spawn(watch_renewals(session, label, fault));

    let session = tokio::select! {
        // the watcher only returns by itself when the keepalive broke
        res = &mut watcher => flatten_join(res)?,
        res = shutdown_signal(cfg.lease.run_for) => {
            res?;
            handle.cancel();
            flatten(watcher).await?
        }
    };

    if cfg.lease.revoke_on_exit {
        manager
            .release_session(session)
            .await
            .context("failed to revoke lease")?;
    } else {
        info!(
            lease = %session.lease().id(),
            ttl = ?session.lease().ttl(),
            "keepalive stopped, lease left to expire"
        );
    }
    debug!(active = manager.active_sessions(), "keepalive sessions remaining");
    Ok(())
}

/// Build the configured coordinator. The memory backend is also returned
/// concretely so faults can be injected into it.
async fn connect(
    cfg: &KeepaliveConfig,
) -> Result<(Arc<dyn Coordinator>, Option<MemoryCoordinator>)> {
    match cfg.coordinator.backend {
        Backend::Etcd => {
            let etcd = EtcdCoordinator::connect(&cfg.coordinator)
                .await
                .context("failed to connect to etcd")?;
            Ok((Arc::new(etcd), None))
        }
        Backend::Memory => {
            info!("using in-memory coordinator");
            let memory = MemoryCoordinator::new().with_auto_renew(renew_interval(cfg.lease.ttl));
            Ok((Arc::new(memory.clone()), Some(memory)))
        }
    }
}

/// Log every renewal until the session ends. Returns the session once it was
/// canceled, or the interruption error.
async fn watch_renewals(
    mut session: KeepaliveSession,
    key: String,
    fault: Option<(MemoryCoordinator, u64)>,
) -> Result<KeepaliveSession> {
    let lease = session.lease().id();
    loop {
        match session.next().await {
            Ok(Some(renewal)) => {
                info!(seq = renewal.seq, "ttl for key {key}: {}", renewal.ttl.as_secs());
                if let Some((memory, after)) = &fault {
                    if renewal.seq >= *after {
                        warn!(%lease, "injecting transport fault");
                        memory.sever(lease, "injected transport fault");
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                error!(%err, key, "keepalive interrupted, lease will expire");
                return Err(anyhow!(err));
            }
        }
    }
    // wait for the renewal stream to be released
    session.cancel().await;
    if let Some(Termination::Interrupted(err)) = session.termination() {
        error!(%err, key, "keepalive interrupted before cancel, lease will expire");
        return Err(anyhow!(err));
    }
    Ok(session)
}

fn flatten_join<T>(res: Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    match res {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err),
        Err(err) => Err(anyhow!(err)),
    }
}

async fn flatten<T>(handle: JoinHandle<Result<T, anyhow::Error>>) -> Result<T, anyhow::Error> {
    flatten_join(handle.await)
}

async fn shutdown_signal(run_for: Option<Duration>) -> Result<()> {
    match run_for {
        Some(run_for) => tokio::select! {
            _ = tokio::time::sleep(run_for) => {
                info!(?run_for, "run time elapsed");
                Ok(())
            }
            res = signal::ctrl_c() => res.map_err(|err| anyhow!(err)),
        },
        None => signal::ctrl_c().await.map_err(|err| anyhow!(err)),
    }
}
