//! Worker harness for the sluice control plane.
//!
//! Starts every core component as a worker pool against the configured
//! Redis brokers and runs until interrupted. Horizontal scaling happens by
//! running more instances of this binary, or by raising the per-component
//! worker counts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use sluice_config::{ConfigLoader, CoreConfig};
use sluice_core::broker::{Broker, RedisBroker};
use sluice_core::dispatch::{
    DispatchClient, FileDispatcher, SubmissionDispatcher,
};
use sluice_core::ingest::{
    CompletionLoop, DropLoop, IngestLoop, Ingester, RetryLoop, Submitter,
};
use sluice_core::plumber::Plumber;
use sluice_core::registry::{ServiceDef, StageRegistry};
use sluice_core::runtime::Supervisor;
use sluice_core::watcher::WatcherServer;

#[derive(Debug, Parser)]
#[command(name = "sluice-server", about = "sluice control-plane workers")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, env = "SLUICE_CONFIG")]
    config: Option<PathBuf>,

    /// Worker replicas for the ingest loop.
    #[arg(long, default_value_t = 2)]
    ingest_workers: usize,

    /// Worker replicas for the submitter.
    #[arg(long, default_value_t = 1)]
    submit_workers: usize,

    /// Worker replicas for the file dispatcher.
    #[arg(long, default_value_t = 2)]
    dispatch_workers: usize,

    /// Worker replicas for the submission dispatcher.
    #[arg(long, default_value_t = 1)]
    submission_workers: usize,

    /// Interval between counter exports, in seconds.
    #[arg(long, default_value_t = 60)]
    export_interval: u64,
}

fn build_registry(config: &CoreConfig) -> StageRegistry {
    let services = config
        .services
        .entries
        .iter()
        .map(|entry| ServiceDef {
            name: entry.name.clone(),
            stage: entry.stage.clone(),
            timeout: entry.timeout_seconds.map(Duration::from_secs),
            failure_limit: entry.failure_limit,
            enabled: entry.enabled,
        })
        .collect();
    StageRegistry::new(config.services.stages.clone(), services)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_config_path(path);
    }
    let config = Arc::new(loader.load().context("loading configuration")?);

    let volatile: Arc<dyn Broker> = Arc::new(
        RedisBroker::connect(&config.redis.url)
            .await
            .context("connecting to volatile redis")?,
    );
    let persistent: Arc<dyn Broker> = Arc::new(
        RedisBroker::connect(&config.redis.persistent_url)
            .await
            .context("connecting to persistent redis")?,
    );

    let caps = Arc::new(build_registry(&config));

    let ingester = Arc::new(Ingester::new(
        config.clone(),
        caps.clone(),
        volatile.clone(),
        persistent.clone(),
    ));
    ingester
        .recover()
        .await
        .context("recovering orphaned duplicate queues")?;
    let submitter = Arc::new(Submitter::new(
        config.clone(),
        ingester.clone(),
        persistent.clone(),
    ));
    let file_dispatcher = Arc::new(FileDispatcher::new(
        config.clone(),
        caps.clone(),
        volatile.clone(),
        persistent.clone(),
    ));
    let submission_dispatcher = Arc::new(SubmissionDispatcher::new(
        config.clone(),
        caps.clone(),
        volatile.clone(),
        persistent.clone(),
    ));
    let watcher = Arc::new(WatcherServer::new(
        persistent.clone(),
        Duration::from_millis(config.watcher.poll_interval_ms),
    ));
    let plumber = Arc::new(Plumber::new(
        caps.clone(),
        DispatchClient::new(volatile.clone(), persistent.clone()),
        Duration::from_secs(5),
    ));

    let mut supervisor = Supervisor::new();
    supervisor.spawn(Arc::new(IngestLoop::new(ingester.clone())), args.ingest_workers);
    supervisor.spawn(Arc::new(CompletionLoop::new(ingester.clone())), 1);
    supervisor.spawn(Arc::new(RetryLoop::new(ingester.clone())), 1);
    supervisor.spawn(Arc::new(DropLoop::new(ingester.clone())), 1);
    supervisor.spawn(submitter, args.submit_workers);
    supervisor.spawn(file_dispatcher, args.dispatch_workers);
    supervisor.spawn(submission_dispatcher, args.submission_workers);
    supervisor.spawn(watcher, 1);
    supervisor.spawn(plumber, 1);

    let export = ingester.counters().start_export(
        Duration::from_secs(args.export_interval),
        supervisor.token(),
    );

    info!("sluice control plane started");
    shutdown_signal().await;
    info!("shutting down, finishing in-flight work");

    supervisor.shutdown().await;
    let _ = export.await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        )
        .expect("installing SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
