//! Periodic expiry and eviction of upload sessions.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::service::UploadService;

/// Runs [`UploadService::sweep`] on a fixed interval in a background task.
pub struct Sweeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Starts sweeping every `interval`. The first sweep runs immediately.
    pub fn start(service: Arc<UploadService>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = service.sweep(Utc::now()).await;
                        if report.expired > 0 || report.evicted > 0 {
                            info!(
                                expired = report.expired,
                                evicted = report.evicted,
                                chunks_removed = report.chunks_removed,
                                "sweep finished"
                            );
                        }
                    }
                    _ = token.cancelled() => {
                        debug!("sweeper stopped");
                        break;
                    }
                }
            }
        });

        Self { cancel, handle }
    }

    /// Stops the background task and waits for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}
