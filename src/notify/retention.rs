//! Background retention cleanup for read notifications.
//!
//! Spawns a tokio task that periodically deletes read notifications older
//! than the configured retention window.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::PersistenceError;
use crate::store::NotificationStore;

/// One cleanup pass across every agency. Returns how many rows were purged.
pub async fn run_cleanup(
    store: &dyn NotificationStore,
    retention_days: u32,
) -> Result<usize, PersistenceError> {
    let count = store.delete_old_read(None, retention_days).await?;
    if count > 0 {
        tracing::info!(count, retention_days, "Notification retention cleanup: purged read notifications");
    } else {
        tracing::debug!("Notification retention cleanup: nothing to purge");
    }
    Ok(count)
}

/// Spawn a background task that runs [`run_cleanup`] every `interval_secs`
/// seconds until `shutdown` fires.
pub fn spawn_retention_cleanup(
    store: Arc<dyn NotificationStore>,
    retention_days: u32,
    interval_secs: u64,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let interval = Duration::from_secs(interval_secs.max(1));

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = run_cleanup(store.as_ref(), retention_days).await {
                tracing::error!(error = %e, "Notification retention cleanup error");
            }
        }
    })
}
