use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::registry::WorkspaceRegistry;

/// Background sweep that reclaims idle sandbox sessions. Sessions with
/// in-flight references are never touched, however long they have been
/// running; a sweep failure is logged and the loop keeps going.
pub struct IdleReaper {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl IdleReaper {
    pub fn spawn(registry: WorkspaceRegistry, ttl: Duration, interval: Duration) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so a fresh server
            // does not sweep before anything can have gone idle.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = registry.sweep(ttl).await;
                        if evicted.is_empty() {
                            debug!("reaper sweep found nothing to evict");
                        } else {
                            info!(workspaces = ?evicted, "reaper evicted idle sessions");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("reaper shutting down");
                        break;
                    }
                }
            }
        });
        Self { handle, shutdown }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}
