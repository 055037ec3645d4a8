mod config;
mod error;
mod routes;
mod scheduler;
mod state;
mod ws;

use crate::config::DaemonConfig;
use crate::scheduler::TickScheduler;
use crate::state::AppState;
use std::sync::Arc;
use store_backup::utils::{blocking, logger};
use store_backup::BackupSystem;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let daemon = DaemonConfig::from_env();
    let config = daemon.pipeline()?;

    // Initialize logging
    logger::init(&config.log.level)?;
    tracing::info!("Starting store-backup-daemon v{} on port {}", env!("CARGO_PKG_VERSION"), daemon.port);

    // Apply any staged restore before anything opens the live data file
    let (system, startup) = blocking(move || BackupSystem::boot(config)).await?;
    if let store_backup::StartupOutcome::Aborted { reason } = &startup {
        tracing::error!("Staged restore was not applied ({reason}); the original data is intact and unchanged");
    }

    let service = system.service.clone();
    match blocking(move || service.sweep_interrupted()).await {
        Ok(0) => {}
        Ok(n) => tracing::info!(removed = n, "Removed interrupted backup artifacts"),
        Err(e) => tracing::warn!("Failed to sweep partial artifacts: {}", e),
    }

    let tick_cron = system.config.schedule.tick_cron.clone();
    let state = Arc::new(AppState::new(system, startup));
    let cancel = CancellationToken::new();

    // Initialize cron scheduler
    let scheduler = match TickScheduler::new(state.clone()).await {
        Ok(s) => {
            if let Err(e) = s.schedule_ticks(&tick_cron).await {
                tracing::warn!("Failed to schedule backups: {}", e);
            }
            if let Err(e) = s.start().await {
                tracing::warn!("Failed to start scheduler: {}", e);
            }
            Some(s)
        }
        Err(e) => {
            tracing::warn!("Failed to create scheduler: {}", e);
            None
        }
    };

    // Build router
    let app = routes::create_router(state.clone());

    // Start HTTP server
    let addr = format!("0.0.0.0:{}", daemon.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    // Graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    tracing::info!("Shutting down...");
    cancel.cancel();

    // Stop scheduler
    if let Some(s) = scheduler {
        if let Err(e) = s.shutdown().await {
            tracing::warn!("Scheduler shutdown error: {}", e);
        }
    }

    // Release the live database and catalog
    state.system.close();
    tracing::info!("Daemon stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
        _ = cancel.cancelled() => {},
    }

    cancel.cancel();
}
