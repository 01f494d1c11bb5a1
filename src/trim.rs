use crate::adapter::ImageCache;
use crate::backend::StorageBackend;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Run [`ImageCache::trim`] every `interval` until `cancel` fires.
///
/// The first sweep starts one full interval after spawning. Cancelling stops
/// the loop and any sweep in progress at its next checkpoint.
pub fn spawn_trim_task<B: StorageBackend>(
    cache: Arc<ImageCache<B>>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = cache.trim(&cancel).await;
                    if report.cancelled {
                        break;
                    }
                }
            }
        }
        tracing::info!("Cache trim task stopped");
    })
}
