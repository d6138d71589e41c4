//! Background tasks owned by the orchestrator.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::local::BoundedLocalCache;

/// A spawned background task plus the signal that stops it.
pub struct TaskHandle {
    /// Task handle for the loop
    handle: JoinHandle<()>,
    /// Shutdown signal
    shutdown: oneshot::Sender<()>,
}

impl TaskHandle {
    pub fn new(handle: JoinHandle<()>, shutdown: oneshot::Sender<()>) -> Self {
        Self { handle, shutdown }
    }

    /// Signal the task and wait for it to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Start the periodic TTL sweep over the local tier.
///
/// The first sweep runs one full `interval` after start. Dropping the
/// returned handle without calling `stop` also ends the loop.
pub fn spawn_ttl_sweeper(local: Arc<BoundedLocalCache>, interval: Duration) -> TaskHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

    let handle = tokio::spawn(async move {
        tracing::debug!(interval_secs = interval.as_secs_f64(), "L1 TTL sweeper started");
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = local.remove_expired();
                    if removed > 0 {
                        tracing::debug!(removed, "Swept expired L1 entries");
                    }
                    let stats = local.stats();
                    crate::metrics::set_cache_usage("L1", stats.entries, stats.memory_bytes);
                }
                _ = &mut shutdown_rx => {
                    tracing::debug!("L1 TTL sweeper shutting down");
                    break;
                }
            }
        }
    });

    TaskHandle::new(handle, shutdown_tx)
}
