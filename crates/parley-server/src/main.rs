mod jobs;
mod mailer;
mod storage;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use parley_core::{Config, EventBus, ForumCatalog, ForumManager, MailDispatcher, NotificationHandler};
use parley_db::SqliteStore;

use crate::mailer::PickupDirMailer;
use crate::storage::LocalFileStorage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,parley_core=debug,parley_db=info".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Init store and collaborators
    let store = Arc::new(SqliteStore::open(&config.db_path)?);
    let catalog = Arc::new(ForumCatalog::load(store).await?);
    let files = Arc::new(LocalFileStorage::new(config.files_dir.clone()).await?);
    let mailer = Arc::new(PickupDirMailer::new(config.templates_dir.clone(), config.outbox_dir.clone()).await?);

    let mut events = EventBus::new();
    Arc::new(NotificationHandler::new(catalog.clone())).register(&mut events);

    // Entry point for the request layer; it lives as long as the process.
    let _manager = Arc::new(ForumManager::new(catalog.clone(), files, events, &config));
    let dispatcher = Arc::new(MailDispatcher::new(catalog.clone(), mailer));

    let cancel = CancellationToken::new();
    let dispatch = tokio::spawn(jobs::run_dispatch_loop(
        dispatcher.clone(),
        config.mail_interval,
        cancel.clone(),
    ));
    let housekeeping = tokio::spawn(jobs::run_housekeeping_loop(
        dispatcher,
        config.queue_retention_days,
        cancel.clone(),
    ));

    info!(
        "Parley forum engine running ({} permission types, mail every {}s, retention {} days)",
        catalog.resolver().permission_types().len(),
        config.mail_interval.as_secs(),
        config.queue_retention_days
    );

    shutdown_signal().await;
    cancel.cancel();

    for (name, task) in [("dispatch", dispatch), ("housekeeping", housekeeping)] {
        if let Err(e) = task.await {
            warn!("{} task ended abnormally: {}", name, e);
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
