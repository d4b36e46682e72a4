//! Background expiry sweep
//!
//! Reads already treat expired entries as absent, so the sweeper only
//! reclaims memory early. It runs on its own tokio task and stops when
//! [`Sweeper::shutdown`] is called or the handle is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache_manager::CacheManager;

/// Handle to a running sweep task
pub struct Sweeper {
    interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
    purged: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Spawn the sweep loop; must be called inside a tokio runtime
    #[must_use]
    pub fn start(manager: Arc<CacheManager>, interval: Duration) -> Self {
        let interval = interval.max(Duration::from_millis(10));
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut shutdown_rx = shutdown_tx.subscribe();
        let purged = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&purged);

        let handle = tokio::spawn(async move {
            info!(interval_ms = interval.as_millis(), "Cache sweeper started");
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = manager.purge_expired();
                        if removed > 0 {
                            counter.fetch_add(removed as u64, Ordering::Relaxed);
                            debug!(removed, "Sweep purged expired entries");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Cache sweeper shutting down");
                        break;
                    }
                }
            }
        });

        Self {
            interval,
            shutdown_tx,
            purged,
            handle: Some(handle),
        }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Entries removed by sweeps so far
    #[must_use]
    pub fn purged(&self) -> u64 {
        self.purged.load(Ordering::Relaxed)
    }

    /// Signal the task and wait for it to exit
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Sweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweeper")
            .field("interval", &self.interval)
            .field("purged", &self.purged())
            .finish_non_exhaustive()
    }
}
