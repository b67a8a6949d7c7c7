//! Background sweep that deletes sessions left idle past the inactivity threshold.

use crate::config::ReaperConfig;
use crate::metrics::ServiceMetrics;
use crate::session::SessionRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Periodically removes inactive sessions from a registry.
pub struct Reaper {
    registry: Arc<SessionRegistry>,
    config: ReaperConfig,
    metrics: Arc<ServiceMetrics>,
}

impl Reaper {
    /// Build a reaper over `registry`.
    pub fn new(
        registry: Arc<SessionRegistry>,
        config: ReaperConfig,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        Self {
            registry,
            config,
            metrics,
        }
    }

    /// Delete every session idle for longer than `threshold` and return how many went.
    ///
    /// A session that is in use, or touched while the sweep waits for it, is kept. A
    /// failed deletion is logged and leaves the session intact for the next sweep.
    pub async fn sweep_now(&self, threshold: Duration) -> usize {
        let candidates = self.registry.idle_sessions(threshold).await;
        let mut removed = 0usize;
        for id in candidates {
            match self.registry.delete_if_idle(id, threshold).await {
                Ok(true) => {
                    tracing::info!(session_id = %id, "Reaped inactive session");
                    removed += 1;
                }
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(session_id = %id, error = %error, "Failed to reap session");
                }
            }
        }
        if removed > 0 {
            self.metrics.record_sessions_reaped(removed as u64);
        }
        removed
    }

    /// Run sweeps every configured interval until `shutdown` is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.config.interval;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(
                interval_secs = period.as_secs(),
                threshold_secs = self.config.inactivity_threshold.as_secs(),
                "Session reaper started"
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.sweep_now(self.config.inactivity_threshold).await;
                        tracing::debug!(removed, "Reaper sweep finished");
                    }
                }
            }
            tracing::info!("Session reaper stopped");
        })
    }
}
