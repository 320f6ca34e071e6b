use color_eyre::eyre::{self, eyre};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vps_core::{
    shutdown_channel, Collaborators, DfProbe, FileLedger, FileStatsStore, JsonFileStore,
    LogNotifier, VpsConfig, VpsHost,
};
use vps_runtime::{ContainerRuntime, DockerRuntime, TimeoutRuntime};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,vps_core=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("VPS_LOG_JSON").is_ok_and(|v| v == "1") {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    init_tracing();

    let config = VpsConfig::load(None).map_err(|e| eyre!("loading configuration: {e:#}"))?;
    info!(data_dir = %config.data_dir.display(), "Starting VPS host daemon...");

    std::fs::create_dir_all(&config.data_dir)?;

    let docker = DockerRuntime::connect_local(config.runtime.stop_timeout_secs)?;
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        TimeoutRuntime::new(docker, config.runtime.call_timeout())
            .with_create_timeout(config.runtime.create_timeout()),
    );

    let ledger = FileLedger::open(config.ledger_path())?;
    let stats_store = FileStatsStore::open(config.stats_dir())?;

    let host = Arc::new(VpsHost::new(
        config.clone(),
        Collaborators {
            runtime: runtime.clone(),
            disk: Arc::new(DfProbe::new(runtime)),
            registry_store: Arc::new(JsonFileStore::new(config.registry_path())),
            stats_store: Arc::new(stats_store),
            ledger: Arc::new(ledger),
            notifier: Arc::new(LogNotifier),
        },
    ));

    let report = host.reconcile().await;
    info!(
        instances = report.checked,
        corrected = report.corrected,
        missing = report.missing,
        "Registry reconciled with the container runtime"
    );
    if report.missing > 0 {
        warn!(missing = report.missing, "Some instances have no container");
    }

    let (trigger, shutdown) = shutdown_channel();
    let handles = host.spawn_background(shutdown);
    info!(loops = handles.len(), "Background loops running");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, waiting for in-flight cycles...");
    trigger.trigger();

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Background loop panicked");
        }
    }
    info!("VPS host daemon stopped");
    Ok(())
}
