//! Page-view retention sweep.

use anyhow::Result;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::TrackingConfig;
use crate::repository::SessionRepository;

/// Delete page views older than `days`. Returns the number removed.
pub async fn sweep_page_views(repository: &SessionRepository, days: u32) -> Result<u64> {
    let removed = repository.cleanup_old_page_views(days).await?;
    if removed > 0 {
        info!(removed, retention_days = days, "Swept old page views");
    }
    Ok(removed)
}

/// Run the sweep at boot and then on every interval tick. `None` when
/// retention is disabled.
pub fn spawn_retention_sweep(
    repository: Arc<SessionRepository>,
    config: &TrackingConfig,
) -> Option<JoinHandle<()>> {
    let days = config.retention_days?;
    let period = config.sweep_interval;
    info!(retention_days = days, interval_secs = period.as_secs(), "Page-view retention enabled");

    Some(tokio::spawn(async move {
        // The first tick completes immediately
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if let Err(e) = sweep_page_views(&repository, days).await {
                warn!("Page-view sweep failed: {:#}", e);
            }
        }
    }))
}
