//! Unattended daemon entry point: loads configuration, wires the catalog,
//! key/value store, resource controller, both scheduler pools, the
//! filesystem watcher and its consumer, and the snapshot writer, then runs
//! until told to shut down.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vidforge_core::catalog::PgCatalog;
use vidforge_core::catalog_update::CatalogUpdate;
use vidforge_core::integrity::IntegrityChecker;
use vidforge_core::kv::RedisKv;
use vidforge_core::resource::{ProcMetrics, ResourceController};
use vidforge_core::scheduler::Scheduler;
use vidforge_core::snapshot::SnapshotWriter;
use vidforge_core::supervisor::Supervisor;
use vidforge_core::types::JobKind;
use vidforge_core::watch::consumer::EventConsumer;
use vidforge_core::watch::FsWatcher;

#[derive(Parser, Debug)]
#[command(name = "vidforge-daemon")]
#[command(about = "Resource-aware video transcoding orchestrator")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, env = "VIDFORGE_CONFIG", default_value = "vidforge.toml")]
    config: std::path::PathBuf,

    /// Run one scheduling pass worth of startup wiring, then exit instead of
    /// looping forever. Intended for config validation and smoke tests.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vidforge_daemon=info,vidforge_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Arc::new(vidforge_config::load(&args.config)?);
    info!(sources = settings.sources.len(), encode_version = %settings.encode_version, "configuration loaded");

    tokio::fs::create_dir_all(&settings.output_dir).await?;

    let pg = PgCatalog::connect(&settings.catalog_url).await?;
    pg.ensure_schema().await?;
    let catalog: Arc<dyn vidforge_core::catalog::Catalog> = Arc::new(pg);

    let redis = RedisKv::connect(&settings.kv_url).await?;
    let kv: Arc<dyn vidforge_core::kv::KvStore> = Arc::new(redis);

    let metrics = Arc::new(ProcMetrics::new());
    let resource_controller = ResourceController::spawn(settings.clone(), metrics.clone());
    let penalties = resource_controller.penalties();

    let catalog_update = Arc::new(CatalogUpdate::new(
        catalog.clone(),
        kv.clone(),
        settings.indexer_url.clone(),
        settings.encode_version.clone(),
    ));

    let integrity_checker = Arc::new(IntegrityChecker::new(catalog.clone(), kv.clone(), settings.clone()));
    let supervisor = Arc::new(Supervisor::new(
        catalog.clone(),
        settings.clone(),
        integrity_checker.clone(),
        catalog_update.clone(),
    ));

    let transcode_scheduler = Arc::new(Scheduler::new(
        JobKind::Transcode,
        catalog.clone(),
        supervisor.clone(),
        penalties.clone(),
        settings.clone(),
    ));
    let integrity_scheduler = Arc::new(Scheduler::new(
        JobKind::Integrity,
        catalog.clone(),
        integrity_checker.clone(),
        penalties.clone(),
        settings.clone(),
    ));

    let watch_shutdown = tokio_util::sync::CancellationToken::new();
    let watcher = FsWatcher::spawn(settings.clone(), kv.clone(), watch_shutdown.clone())?;

    let consumer = Arc::new(EventConsumer::new(kv.clone(), catalog_update.clone()));
    let consumer_shutdown = watch_shutdown.clone();
    let consumer_task = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.run(consumer_shutdown).await })
    };

    let snapshot_writer = Arc::new(SnapshotWriter::new(
        catalog.clone(),
        transcode_scheduler.clone(),
        integrity_scheduler.clone(),
        penalties.clone(),
        metrics.clone(),
        settings.clone(),
    ));
    let snapshot_shutdown = watch_shutdown.clone();
    let snapshot_task = {
        let snapshot_writer = snapshot_writer.clone();
        tokio::spawn(async move { snapshot_writer.run(snapshot_shutdown).await })
    };

    let transcode_task = tokio::spawn(transcode_scheduler.clone().start());
    let integrity_task = tokio::spawn(integrity_scheduler.clone().start());

    if args.once {
        info!("startup wiring validated, exiting due to --once");
    } else {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received, draining in-flight jobs");
    }

    transcode_scheduler.stop();
    integrity_scheduler.stop();
    watch_shutdown.cancel();

    let _ = transcode_task.await;
    let _ = integrity_task.await;
    let _ = consumer_task.await;
    let _ = snapshot_task.await;
    watcher.join().await;
    resource_controller.shutdown().await;

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler, falling back to ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
