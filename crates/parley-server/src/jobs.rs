use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_core::MailDispatcher;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Background task that drains the mail queue on a fixed period until cancelled.
pub async fn run_dispatch_loop(dispatcher: Arc<MailDispatcher>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        match dispatcher.dispatch(&cancel).await {
            Ok(report) => {
                if report.cancelled {
                    break;
                }
                debug!(?report, "mail dispatch pass complete");
            }
            Err(e) => {
                warn!("Mail dispatch error: {}", e);
            }
        }
    }

    info!("Mail dispatch loop stopped");
}

/// Background task that truncates sent queue rows older than the retention window, once a day.
pub async fn run_housekeeping_loop(dispatcher: Arc<MailDispatcher>, retention_days: i64, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(HOUSEKEEPING_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let horizon = Utc::now() - chrono::Duration::days(retention_days);
        if let Err(e) = dispatcher.truncate_mail_queue(horizon).await {
            warn!("Mail queue housekeeping error: {}", e);
        }
    }

    info!("Housekeeping loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::ForumCatalog;
    use parley_core::ports::Mailer;
    use parley_db::SqliteStore;
    use parley_types::mail::{DigestPayload, MailTemplate};
    use uuid::Uuid;

    struct NoMail;

    #[async_trait::async_trait]
    impl Mailer for NoMail {
        async fn resolve_template(&self, _template_id: Uuid) -> anyhow::Result<Option<MailTemplate>> {
            Ok(None)
        }

        async fn send(&self, _: &MailTemplate, _: &DigestPayload, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    async fn dispatcher() -> Arc<MailDispatcher> {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let catalog = Arc::new(ForumCatalog::load(store).await.unwrap());
        Arc::new(MailDispatcher::new(catalog, Arc::new(NoMail)))
    }

    #[tokio::test]
    async fn test_loops_stop_on_cancel() {
        let dispatcher = dispatcher().await;
        let cancel = CancellationToken::new();

        let dispatch = tokio::spawn(run_dispatch_loop(
            dispatcher.clone(),
            Duration::from_millis(10),
            cancel.clone(),
        ));
        let housekeeping = tokio::spawn(run_housekeeping_loop(dispatcher, 30, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), dispatch)
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), housekeeping)
            .await
            .unwrap()
            .unwrap();
    }
}
