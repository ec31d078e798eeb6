use anyhow::Context;
use deacon_executor::DockerRuntime;
use deacon_orchestrator::{
    AlertDispatcher, BackupManager, DeaconConfig, HealthChecker, InstanceManager,
    MaintenanceTask, ManagerSettings, Metrics, StateStore, TaskScheduler, UpgradeRunner,
};
use deacon_server::{create_app, spawn_server, AppState};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    // RUST_LOG wins, then the legacy LOG_LEVEL
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
            EnvFilter::try_new(level.to_lowercase())
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = DeaconConfig::from_env().context("Invalid configuration")?;
    info!(
        image = %config.image,
        network = %config.network,
        state_file = %config.state_file.display(),
        health_interval_secs = config.health_check_interval.as_secs(),
        upgrade_interval_secs = config.upgrade_interval.as_secs(),
        backup_interval_secs = config.backup_interval.as_secs(),
        exec_timeout_secs = config.exec_timeout.as_secs(),
        listen = %config.api_addr,
        "Deacon starting"
    );

    let docker = Arc::new(
        DockerRuntime::connect_local(config.helper_image.clone())
            .context("Failed to connect to Docker")?,
    );
    docker.ping().await.context("Docker daemon is not responding")?;

    let store = Arc::new(
        StateStore::open(&config.state_file)
            .await
            .context("Failed to load instance state")?,
    );
    let metrics = Arc::new(Metrics::new());
    let alerts = Arc::new(AlertDispatcher::new(
        config.alert_webhook_url.clone(),
        config.alert_history_limit,
        metrics.clone(),
    )?);
    let manager = Arc::new(InstanceManager::new(
        store,
        docker.clone(),
        docker.clone(),
        ManagerSettings::from_config(&config),
        metrics.clone(),
    ));

    let health: Arc<dyn MaintenanceTask> = Arc::new(
        HealthChecker::new(docker.clone(), alerts.clone(), metrics.clone())
            .with_exec_timeout(config.exec_timeout),
    );
    let upgrade: Arc<dyn MaintenanceTask> = Arc::new(
        UpgradeRunner::new(docker.clone(), alerts.clone(), metrics.clone())
            .with_exec_timeout(config.exec_timeout),
    );
    let backup: Arc<dyn MaintenanceTask> = Arc::new(
        BackupManager::new(
            docker.clone(),
            alerts.clone(),
            metrics.clone(),
            config.backup_dir.clone(),
            config.backup_retention,
        )
        .with_exec_timeout(config.exec_timeout),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = AppState::new(
        manager,
        health.clone(),
        upgrade.clone(),
        backup.clone(),
        alerts,
        metrics,
    );
    let app = create_app(state.clone());
    let listener = tokio::net::TcpListener::bind(config.api_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.api_addr))?;
    info!(addr = %config.api_addr, "Control API listening");
    let server = spawn_server(listener, app, shutdown_rx.clone());

    // one pass before the first interval elapses, with the API already up
    health.run().await;

    let scheduler = TaskScheduler::new()
        .every(config.health_check_interval, health)
        .every(config.upgrade_interval, upgrade)
        .every(config.backup_interval, backup);
    let mut scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx));

    let early_exit = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            None
        }
        joined = &mut scheduler_handle => Some(joined),
    };
    let _ = shutdown_tx.send(true);

    let scheduler_result = match early_exit {
        Some(joined) => joined,
        None => scheduler_handle.await,
    };
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Control API server error"),
        Err(e) => error!(error = %e, "Control API task failed"),
    }
    state.drain_background(config.shutdown_grace).await;

    match scheduler_result {
        Ok(Ok(())) => {
            info!("Deacon stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "Scheduler terminated");
            Err(e.into())
        }
        Err(e) => {
            error!(error = %e, "Scheduler task failed");
            Err(e.into())
        }
    }
}
